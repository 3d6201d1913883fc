use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::rule::Rule;
use crate::AlertRule;

/// Recheck at most every half hour when far from the cap, but never less
/// often than this as the cap approaches.
const MAX_RECHECK_SECS: f64 = 1800.0;
const MIN_RECHECK_SECS: f64 = 180.0;

/// Live accounting of a transfer-cycle rule, exposed to the dashboard UI and
/// used to throttle the underlying usage queries.
#[derive(Debug, Clone)]
pub struct CycleTransferStats {
    pub name: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub max: u64,
    pub min: u64,
    pub server_name: HashMap<u64, String>,
    pub transfer: HashMap<u64, u64>,
    pub next_update: HashMap<u64, DateTime<Utc>>,
}

impl CycleTransferStats {
    /// Builds the stats entry for the first transfer-cycle sub-rule of an
    /// alert rule, if it has one.
    pub fn from_alert(alert: &AlertRule, now: DateTime<Utc>) -> Option<Self> {
        let rule = alert.rules.iter().find(|r| r.is_transfer_cycle())?;
        let (from, to) = rule.cycle_period(now);
        Some(Self {
            name: alert.name.clone(),
            from,
            to,
            max: rule.max as u64,
            min: rule.min as u64,
            server_name: HashMap::new(),
            transfer: HashMap::new(),
            next_update: HashMap::new(),
        })
    }

    /// Whether the usage for this server should be recomputed now.
    pub fn is_due(&self, server_id: u64, now: DateTime<Utc>) -> bool {
        self.next_update
            .get(&server_id)
            .is_none_or(|t| now >= *t)
    }

    /// Last usage recorded for a server.
    pub fn cached(&self, server_id: u64) -> Option<u64> {
        self.transfer.get(&server_id).copied()
    }

    /// Stores a fresh usage figure and schedules the next recheck: the
    /// closer the usage is to the cap, the sooner it is re-read.
    pub fn record(
        &mut self,
        rule: &Rule,
        server_id: u64,
        server_name: &str,
        usage: u64,
        now: DateTime<Utc>,
    ) {
        let (from, to) = rule.cycle_period(now);
        self.from = from;
        self.to = to;

        let headroom = if self.max > 0 {
            self.max.saturating_sub(usage) as f64 / self.max as f64
        } else {
            0.0
        };
        let delay = (MAX_RECHECK_SECS * headroom).clamp(MIN_RECHECK_SECS, MAX_RECHECK_SECS);

        self.server_name.insert(server_id, server_name.to_owned());
        self.transfer.insert(server_id, usage);
        self.next_update
            .insert(server_id, now + Duration::seconds(delay as i64));
    }

    /// Drops per-server state, e.g. when a server is deleted.
    pub fn forget_server(&mut self, server_id: u64) {
        self.server_name.remove(&server_id);
        self.transfer.remove(&server_id);
        self.next_update.remove(&server_id);
    }
}
