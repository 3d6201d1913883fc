use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use fleetmon_common::types::Ip;
use fleetmon_storage::entities::ddns_profile;

use crate::error::{Result, ServerError};

/// A DDNS update profile. Only the provider-independent core plus the
/// webhook provider are modeled; vendor API adapters plug in elsewhere.
#[derive(Debug, Clone)]
pub struct DdnsProfile {
    pub id: u64,
    pub name: String,
    pub provider: String,
    pub enable_ipv4: bool,
    pub enable_ipv6: bool,
    pub max_retries: u32,
    pub domains: Vec<String>,
    pub webhook_url: String,
    pub webhook_method: i32,
    pub webhook_request_body: String,
    pub webhook_headers: String,
}

impl DdnsProfile {
    pub fn from_model(m: ddns_profile::Model) -> Self {
        Self {
            id: m.id as u64,
            name: m.name,
            provider: m.provider,
            enable_ipv4: m.enable_ipv4,
            enable_ipv6: m.enable_ipv6,
            max_retries: m.max_retries.clamp(1, 10) as u32,
            domains: serde_json::from_str(&m.domains_raw).unwrap_or_default(),
            webhook_url: m.webhook_url,
            webhook_method: m.webhook_method,
            webhook_request_body: m.webhook_request_body,
            webhook_headers: m.webhook_headers,
        }
    }
}

/// One pending update: a profile applied to a concrete address set and
/// domain list.
pub struct DdnsUpdater {
    profile: Arc<DdnsProfile>,
    ip: Ip,
}

impl DdnsUpdater {
    pub fn profile_id(&self) -> u64 {
        self.profile.id
    }
}

/// Profile registry plus best-effort update dispatch.
pub struct DdnsManager {
    profiles: RwLock<HashMap<u64, Arc<DdnsProfile>>>,
    client: reqwest::Client,
}

impl DdnsManager {
    pub fn load(models: Vec<ddns_profile::Model>) -> Self {
        let mut profiles = HashMap::new();
        for m in models {
            let profile = Arc::new(DdnsProfile::from_model(m));
            profiles.insert(profile.id, profile);
        }
        Self {
            profiles: RwLock::new(profiles),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn update_profile(&self, profile: DdnsProfile) {
        self.profiles
            .write()
            .unwrap()
            .insert(profile.id, Arc::new(profile));
    }

    pub fn delete_profiles(&self, ids: &[u64]) {
        let mut profiles = self.profiles.write().unwrap();
        for id in ids {
            profiles.remove(id);
        }
    }

    /// Resolves profile ids to updaters for the given address set. Unknown
    /// ids are an error so misconfigured servers surface loudly.
    pub fn updaters_for(&self, profile_ids: &[u64], ip: &Ip) -> Result<Vec<DdnsUpdater>> {
        let profiles = self.profiles.read().unwrap();
        profile_ids
            .iter()
            .map(|id| {
                profiles
                    .get(id)
                    .cloned()
                    .map(|profile| DdnsUpdater {
                        profile,
                        ip: ip.clone(),
                    })
                    .ok_or(ServerError::NotFound {
                        entity: "ddns profile",
                        id: *id,
                    })
            })
            .collect()
    }

    /// Runs one update; `override_domains` replaces the profile's domain
    /// list when non-empty. Failures are logged, never propagated.
    pub async fn run_update(&self, updater: &DdnsUpdater, override_domains: &[String]) {
        let domains: &[String] = if override_domains.is_empty() {
            &updater.profile.domains
        } else {
            override_domains
        };

        for domain in domains {
            match updater.profile.provider.as_str() {
                "dummy" => {
                    tracing::info!(
                        profile = %updater.profile.name,
                        domain,
                        ip = %updater.ip.join(),
                        "ddns dummy update"
                    );
                }
                "webhook" => {
                    self.webhook_update(&updater.profile, domain, &updater.ip)
                        .await;
                }
                other => {
                    tracing::warn!(provider = other, "unknown ddns provider");
                }
            }
        }
    }

    async fn webhook_update(&self, profile: &DdnsProfile, domain: &str, ip: &Ip) {
        let mut addresses = Vec::new();
        if profile.enable_ipv4 && !ip.ipv4_addr.is_empty() {
            addresses.push(ip.ipv4_addr.clone());
        }
        if profile.enable_ipv6 && !ip.ipv6_addr.is_empty() {
            addresses.push(ip.ipv6_addr.clone());
        }

        for addr in addresses {
            let url = render_webhook(&profile.webhook_url, domain, &addr);
            let body = render_webhook(&profile.webhook_request_body, domain, &addr);

            let mut attempt = 0;
            loop {
                attempt += 1;
                let mut req = if profile.webhook_method == 1 {
                    self.client.get(&url)
                } else {
                    self.client.post(&url).body(body.clone())
                };
                if let Ok(headers) = serde_json::from_str::<HashMap<String, String>>(
                    &profile.webhook_headers,
                ) {
                    for (k, v) in headers {
                        req = req.header(k, v);
                    }
                }

                match req.send().await {
                    Ok(resp) if resp.status().is_success() => {
                        tracing::info!(profile = %profile.name, domain, ip = %addr, "ddns updated");
                        break;
                    }
                    Ok(resp) => {
                        tracing::warn!(
                            profile = %profile.name,
                            domain,
                            status = %resp.status(),
                            "ddns webhook rejected"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(profile = %profile.name, domain, error = %e, "ddns webhook failed");
                    }
                }
                if attempt >= profile.max_retries {
                    break;
                }
            }
        }
    }
}

fn render_webhook(template: &str, domain: &str, ip: &str) -> String {
    template.replace("#domain#", domain).replace("#ip#", ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_template_rendering() {
        assert_eq!(
            render_webhook("https://dns.example.com/update?d=#domain#&a=#ip#", "x.example.com", "1.2.3.4"),
            "https://dns.example.com/update?d=x.example.com&a=1.2.3.4"
        );
    }

    #[test]
    fn unknown_profile_is_an_error() {
        let manager = DdnsManager::load(vec![]);
        let ip = Ip {
            ipv4_addr: "1.2.3.4".into(),
            ipv6_addr: String::new(),
        };
        assert!(manager.updaters_for(&[9], &ip).is_err());
        assert!(manager.updaters_for(&[], &ip).unwrap().is_empty());
    }
}
