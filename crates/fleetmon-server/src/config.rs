use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use fleetmon_common::util::random_string;

use crate::error::{Result, ServerError};

/// Sentinel value for `agent_real_ip_header`: trust the connecting peer
/// address instead of a forwarded header.
pub const USE_PEER_IP: &str = "FM::Use-Peer-IP";

/// Environment override prefix; `FM_HTTPS_LISTENPORT=443` maps onto
/// `https.listen_port` (underscores in nested keys are insensitive).
const ENV_PREFIX: &str = "FM_";

/// Dotted paths of every recognized scalar key, used to resolve environment
/// overrides against the YAML tree.
const KNOWN_KEYS: &[&str] = &[
    "listen_host",
    "listen_port",
    "grpc_listen_port",
    "nat_listen_port",
    "debug",
    "language",
    "location",
    "force_auth",
    "jwt_timeout",
    "jwt_secret_key",
    "agent_secret_key",
    "avg_ping_count",
    "site_name",
    "custom_code",
    "custom_code_dashboard",
    "user_template",
    "admin_template",
    "install_host",
    "tls",
    "web_real_ip_header",
    "agent_real_ip_header",
    "enable_plain_ip_in_notification",
    "enable_ip_change_notification",
    "ip_change_notification_group_id",
    "cover",
    "ignored_ip_notification",
    "dns_servers",
    "geoip_db_path",
    "https.listen_port",
    "https.tls_cert_path",
    "https.tls_key_path",
    "https.insecure_tls",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Oauth2Endpoint {
    pub auth_url: String,
    pub token_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Oauth2Config {
    pub client_id: String,
    pub client_secret: String,
    pub endpoint: Oauth2Endpoint,
    pub scopes: Vec<String>,
    pub user_info_url: String,
    pub user_id_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpsConfig {
    pub listen_port: u16,
    pub tls_cert_path: String,
    pub tls_key_path: String,
    pub insecure_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    pub grpc_listen_port: u16,
    /// 0 disables the NAT tunnel listener.
    pub nat_listen_port: u16,
    pub debug: bool,
    /// Stored with underscore (`en_US`), exposed with hyphen.
    pub language: String,
    /// IANA timezone of the dashboard.
    pub location: String,
    pub force_auth: bool,
    /// Hours.
    pub jwt_timeout: u32,
    pub jwt_secret_key: String,
    pub agent_secret_key: String,
    pub avg_ping_count: u32,

    pub site_name: String,
    pub custom_code: String,
    pub custom_code_dashboard: String,
    pub user_template: String,
    pub admin_template: String,
    pub install_host: String,
    /// Whether generated agent install commands use TLS.
    pub tls: bool,

    pub web_real_ip_header: String,
    pub agent_real_ip_header: String,

    pub enable_plain_ip_in_notification: bool,
    pub enable_ip_change_notification: bool,
    pub ip_change_notification_group_id: u64,
    /// 1 = notify all except listed, 2 = notify only listed.
    pub cover: u8,
    /// Comma-separated server ids scoped by `cover`.
    pub ignored_ip_notification: String,

    pub dns_servers: String,
    pub geoip_db_path: String,

    pub oauth2: HashMap<String, Oauth2Config>,
    pub https: HttpsConfig,

    #[serde(skip)]
    ignored_ip_notification_server_ids: HashSet<u64>,
    #[serde(skip)]
    path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: String::new(),
            listen_port: 8008,
            grpc_listen_port: 5555,
            nat_listen_port: 0,
            debug: false,
            language: "en_US".into(),
            location: "Asia/Shanghai".into(),
            force_auth: false,
            jwt_timeout: 1,
            jwt_secret_key: String::new(),
            agent_secret_key: String::new(),
            avg_ping_count: 2,
            site_name: String::new(),
            custom_code: String::new(),
            custom_code_dashboard: String::new(),
            user_template: "user-dist".into(),
            admin_template: "admin-dist".into(),
            install_host: String::new(),
            tls: false,
            web_real_ip_header: String::new(),
            agent_real_ip_header: String::new(),
            enable_plain_ip_in_notification: false,
            enable_ip_change_notification: false,
            ip_change_notification_group_id: 0,
            cover: 1,
            ignored_ip_notification: String::new(),
            dns_servers: String::new(),
            geoip_db_path: String::new(),
            oauth2: HashMap::new(),
            https: HttpsConfig::default(),
            ignored_ip_notification_server_ids: HashSet::new(),
            path: PathBuf::new(),
        }
    }
}

impl Config {
    /// Loads the YAML file (if present), overlays `FM_*` environment
    /// variables and fills defaults. Blank secrets are generated and the
    /// file is written back so they survive restarts.
    pub fn load(path: &Path) -> Result<Self> {
        let mut doc: serde_yaml::Value = match std::fs::read_to_string(path) {
            Ok(text) => serde_yaml::from_str(&text)
                .map_err(|e| ServerError::Config(format!("parse {}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                serde_yaml::Value::Mapping(Default::default())
            }
            Err(e) => return Err(e.into()),
        };

        apply_env_overrides(&mut doc, std::env::vars());

        let mut config: Config = serde_yaml::from_value(doc)
            .map_err(|e| ServerError::Config(format!("invalid config: {e}")))?;
        config.path = path.to_path_buf();
        config.apply_defaults()?;
        config.rebuild_ignored_ids();
        Ok(config)
    }

    fn apply_defaults(&mut self) -> Result<()> {
        if self.listen_port == 0 {
            self.listen_port = 8008;
        }
        if self.grpc_listen_port == 0 {
            self.grpc_listen_port = 5555;
        }
        if self.language.is_empty() {
            self.language = "en_US".into();
        } else {
            self.language = self.language.replacen('-', "_", 1);
        }
        if self.location.is_empty() {
            self.location = "Asia/Shanghai".into();
        }
        if self.user_template.is_empty() {
            self.user_template = "user-dist".into();
        }
        if self.admin_template.is_empty() {
            self.admin_template = "admin-dist".into();
        }
        if self.avg_ping_count == 0 {
            self.avg_ping_count = 2;
        }
        if self.cover == 0 {
            self.cover = 1;
        }
        if self.jwt_timeout == 0 {
            self.jwt_timeout = 1;
        }

        let mut dirty = false;
        if self.jwt_secret_key.is_empty() {
            self.jwt_secret_key = random_string(1024);
            dirty = true;
        }
        if self.agent_secret_key.is_empty() {
            self.agent_secret_key = random_string(32);
            dirty = true;
        }
        if dirty && !self.path.as_os_str().is_empty() {
            self.save()?;
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let data = serde_yaml::to_string(self)
            .map_err(|e| ServerError::Config(format!("serialize config: {e}")))?;
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        std::fs::write(&self.path, data)?;
        Ok(())
    }

    fn rebuild_ignored_ids(&mut self) {
        self.ignored_ip_notification_server_ids = self
            .ignored_ip_notification
            .split(',')
            .filter_map(|s| s.trim().parse::<u64>().ok())
            .filter(|id| *id > 0)
            .collect();
    }

    /// Applies a settings update coming from the (out of scope) CRUD
    /// surface: recompute derived fields and persist.
    pub fn update_and_save(&mut self) -> Result<()> {
        self.rebuild_ignored_ids();
        self.save()
    }

    /// Whether an IP change on this server should notify, per `cover` and
    /// the ignore list.
    pub fn should_notify_ip_change(&self, server_id: u64) -> bool {
        if !self.enable_ip_change_notification {
            return false;
        }
        let listed = self.ignored_ip_notification_server_ids.contains(&server_id);
        match self.cover {
            1 => !listed,
            2 => listed,
            _ => false,
        }
    }

    /// Language with a hyphen, for external consumers.
    pub fn language_tag(&self) -> String {
        self.language.replacen('_', "-", 1)
    }

    pub fn timezone(&self) -> chrono_tz::Tz {
        self.location
            .parse()
            .unwrap_or(chrono_tz::Asia::Shanghai)
    }
}

/// Overlays `FM_*` environment variables onto the YAML tree. Matching
/// strips underscores, so `FM_JWTSECRETKEY` and `FM_JWT_SECRET_KEY` both
/// address `jwt_secret_key`, and nested keys concatenate path segments.
fn apply_env_overrides(
    doc: &mut serde_yaml::Value,
    vars: impl Iterator<Item = (String, String)>,
) {
    for (name, value) in vars {
        let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let wanted = rest.to_lowercase().replace('_', "");
        for key in KNOWN_KEYS {
            if key.replace(['_', '.'], "") == wanted {
                set_path(doc, key, &value);
                break;
            }
        }
    }
}

fn set_path(doc: &mut serde_yaml::Value, dotted: &str, raw: &str) {
    let mut node = doc;
    let mut parts = dotted.split('.').peekable();
    while let Some(part) = parts.next() {
        if !node.is_mapping() {
            *node = serde_yaml::Value::Mapping(Default::default());
        }
        let map = node.as_mapping_mut().unwrap();
        let key = serde_yaml::Value::String(part.to_string());
        if parts.peek().is_some() {
            node = map
                .entry(key)
                .or_insert_with(|| serde_yaml::Value::Mapping(Default::default()));
        } else {
            // scalars keep their YAML type (numbers, bools) when they parse
            let value = serde_yaml::from_str(raw)
                .unwrap_or_else(|_| serde_yaml::Value::String(raw.to_string()));
            map.insert(key, value);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in() {
        let mut config = Config {
            listen_port: 0,
            ..Config::default()
        };
        config.jwt_secret_key = "x".into();
        config.agent_secret_key = "y".into();
        config.apply_defaults().unwrap();
        assert_eq!(config.listen_port, 8008);
        assert_eq!(config.language, "en_US");
        assert_eq!(config.location, "Asia/Shanghai");
        assert_eq!(config.avg_ping_count, 2);
        assert_eq!(config.cover, 1);
    }

    #[test]
    fn env_overrides_flat_and_nested() {
        let mut doc: serde_yaml::Value =
            serde_yaml::from_str("listen_port: 9000\nhttps:\n  listen_port: 8443\n").unwrap();
        let vars = vec![
            ("FM_LISTENPORT".to_string(), "7000".to_string()),
            ("FM_HTTPS_LISTENPORT".to_string(), "9443".to_string()),
            ("FM_SITE_NAME".to_string(), "ops".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];
        apply_env_overrides(&mut doc, vars.into_iter());

        let config: Config = serde_yaml::from_value(doc).unwrap();
        assert_eq!(config.listen_port, 7000);
        assert_eq!(config.https.listen_port, 9443);
        assert_eq!(config.site_name, "ops");
    }

    #[test]
    fn ignored_ids_parse() {
        let mut config = Config {
            ignored_ip_notification: "1,2, 5,bogus,0".into(),
            enable_ip_change_notification: true,
            ..Config::default()
        };
        config.rebuild_ignored_ids();

        assert!(!config.should_notify_ip_change(1));
        assert!(config.should_notify_ip_change(3));

        config.cover = 2;
        assert!(config.should_notify_ip_change(5));
        assert!(!config.should_notify_ip_change(3));
    }

    #[test]
    fn generated_secrets_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "listen_port: 9001\nsite_name: probe\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.listen_port, 9001);
        assert_eq!(config.jwt_secret_key.len(), 1024);
        assert_eq!(config.agent_secret_key.len(), 32);

        // the written-back file reloads to the same secrets
        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.jwt_secret_key, config.jwt_secret_key);
        assert_eq!(reloaded.agent_secret_key, config.agent_secret_key);
        assert_eq!(reloaded.site_name, "probe");
    }

    #[test]
    fn language_normalization() {
        let mut config = Config {
            language: "zh-CN".into(),
            jwt_secret_key: "x".into(),
            agent_secret_key: "y".into(),
            ..Config::default()
        };
        config.apply_defaults().unwrap();
        assert_eq!(config.language, "zh_CN");
        assert_eq!(config.language_tag(), "zh-CN");
    }
}
