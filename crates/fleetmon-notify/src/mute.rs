use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Constructors for the reserved mute-label namespace. The group name is
/// appended by the hub so backoff state is scoped per notification group.
pub mod mute_label {
    pub fn ip_changed(server_id: u64) -> String {
        format!("bf::ic-{server_id}")
    }

    pub fn server_incident(alert_id: u64, server_id: u64) -> String {
        format!("bf::sei-{alert_id}-{server_id}")
    }

    pub fn server_incident_resolved(alert_id: u64, server_id: u64) -> String {
        format!("bf::seir-{alert_id}-{server_id}")
    }

    pub fn service_latency_min(service_id: u64) -> String {
        format!("bf::sln-{service_id}")
    }

    pub fn service_latency_max(service_id: u64) -> String {
        format!("bf::slm-{service_id}")
    }

    pub fn service_state_changed(service_id: u64) -> String {
        format!("bf::ssc-{service_id}")
    }

    pub fn service_tls(service_id: u64, info: &str) -> String {
        format!("bf::stls-{service_id}-{info}")
    }

    pub fn with_group(label: &str, group_name: &str) -> String {
        format!("{label}:{group_name}")
    }
}

const FIRST_NOTIFICATION_DELAY: i64 = 15 * 60;
const MAX_BACKOFF: i64 = 24 * 60 * 60;
/// Entries outlive their backoff window by this much so a repeat shortly
/// after expiry still doubles instead of starting over.
const CACHE_GRACE: i64 = 10 * 60;

#[derive(Debug, Clone)]
struct MuteEntry {
    backoff: Duration,
    until: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Anti-nuisance state per mute label. The first emission under a label goes
/// through and arms a 15-minute window; repeats inside the window are
/// dropped; each emission after the window doubles it, capped at one day.
#[derive(Default)]
pub struct MuteCache {
    entries: Mutex<HashMap<String, MuteEntry>>,
}

impl MuteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a notification under `label` may be sent at `now`; updates
    /// the backoff state accordingly.
    pub fn should_send(&self, label: &str, now: DateTime<Utc>) -> bool {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, e| e.expires_at > now);

        match entries.get_mut(label) {
            None => {
                let backoff = Duration::seconds(FIRST_NOTIFICATION_DELAY);
                entries.insert(
                    label.to_string(),
                    MuteEntry {
                        backoff,
                        until: now + backoff,
                        expires_at: now + backoff + Duration::seconds(CACHE_GRACE),
                    },
                );
                true
            }
            Some(entry) => {
                if now <= entry.until {
                    return false;
                }
                let doubled = entry.backoff * 2;
                entry.backoff = doubled.min(Duration::seconds(MAX_BACKOFF));
                entry.until = now + entry.backoff;
                entry.expires_at = now + entry.backoff + Duration::seconds(CACHE_GRACE);
                true
            }
        }
    }

    /// Clears the label so the next event notifies immediately.
    pub fn unmute(&self, label: &str) {
        self.entries.lock().unwrap().remove(label);
    }

    /// Remaining suppression window, for tests and introspection.
    pub fn muted_until(&self, label: &str) -> Option<DateTime<Utc>> {
        self.entries.lock().unwrap().get(label).map(|e| e.until)
    }
}
