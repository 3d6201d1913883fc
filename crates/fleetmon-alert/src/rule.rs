use std::collections::HashMap;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

/// A server is considered offline once no state report has arrived for this
/// long.
const OFFLINE_GRACE_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Cpu,
    Memory,
    Swap,
    Disk,
    NetInSpeed,
    NetOutSpeed,
    NetAllSpeed,
    TransferIn,
    TransferOut,
    TransferAll,
    Offline,
    TransferInCycle,
    TransferOutCycle,
    TransferAllCycle,
    Load1,
    Load5,
    Load15,
    ProcessCount,
    TcpConnCount,
    UdpConnCount,
}

/// Which servers a sub-rule applies to. Stored as 0/1 in the rule JSON.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum RuleCover {
    /// Applies to every server except those in `ignore`.
    #[default]
    All,
    /// Applies only to the servers in `ignore`.
    IgnoreAll,
}

impl From<u8> for RuleCover {
    fn from(v: u8) -> Self {
        if v == 1 {
            RuleCover::IgnoreAll
        } else {
            RuleCover::All
        }
    }
}

impl From<RuleCover> for u8 {
    fn from(v: RuleCover) -> Self {
        match v {
            RuleCover::All => 0,
            RuleCover::IgnoreAll => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleUnit {
    #[default]
    Hour,
    Day,
    Week,
    Month,
    Year,
}

/// One sub-rule of an alert rule, deserialized from the stored JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    #[serde(rename = "type")]
    pub kind: RuleType,
    #[serde(default)]
    pub min: f64,
    #[serde(default)]
    pub max: f64,
    /// Sample count for windowed checks.
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub cover: RuleCover,
    #[serde(default)]
    pub ignore: HashMap<u64, bool>,
    /// Anchor of the transfer accounting cycle, for cycle kinds.
    #[serde(default)]
    pub cycle_start: Option<DateTime<Utc>>,
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval: u32,
    #[serde(default)]
    pub cycle_unit: CycleUnit,
}

fn default_cycle_interval() -> u32 {
    1
}

/// Plain server sample handed to `snapshot` by the engine.
#[derive(Debug, Clone, Default)]
pub struct ServerSnapshot {
    pub id: u64,
    pub name: String,
    pub cpu: f64,
    pub mem_used: u64,
    pub mem_total: u64,
    pub swap_used: u64,
    pub swap_total: u64,
    pub disk_used: u64,
    pub disk_total: u64,
    pub net_in_speed: u64,
    pub net_out_speed: u64,
    pub net_in_transfer: u64,
    pub net_out_transfer: u64,
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub process_count: u64,
    pub tcp_conn_count: u64,
    pub udp_conn_count: u64,
    pub last_active: Option<DateTime<Utc>>,
}

impl Rule {
    pub fn is_transfer_cycle(&self) -> bool {
        matches!(
            self.kind,
            RuleType::TransferInCycle | RuleType::TransferOutCycle | RuleType::TransferAllCycle
        )
    }

    fn is_ignored(&self, server_id: u64) -> bool {
        self.ignore.get(&server_id).copied().unwrap_or(false)
    }

    /// Whether the sub-rule watches this server at all.
    pub fn covers(&self, server_id: u64) -> bool {
        match self.cover {
            RuleCover::All => !self.is_ignored(server_id),
            RuleCover::IgnoreAll => self.is_ignored(server_id),
        }
    }

    /// Boundaries of the accounting cycle containing `now`.
    pub fn cycle_period(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let anchor = self.cycle_start.unwrap_or(now);
        let interval = self.cycle_interval.max(1);
        let step = |t: DateTime<Utc>| match self.cycle_unit {
            CycleUnit::Hour => t + Duration::hours(interval as i64),
            CycleUnit::Day => t + Duration::days(interval as i64),
            CycleUnit::Week => t + Duration::weeks(interval as i64),
            CycleUnit::Month => t + Months::new(interval),
            CycleUnit::Year => t + Months::new(12 * interval),
        };

        if anchor >= now {
            return (anchor, step(anchor));
        }
        let mut from = anchor;
        let mut to = step(from);
        while to <= now {
            from = to;
            to = step(from);
        }
        (from, to)
    }

    /// Checks one tick of one server. Returns true when the sample satisfies
    /// the sub-rule: the value is inside [min,max], the server was recently
    /// active (for `offline`), or the server is not covered at all.
    pub fn snapshot(
        &self,
        server: &ServerSnapshot,
        cycle_usage: Option<u64>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.covers(server.id) {
            return true;
        }

        if self.kind == RuleType::Offline {
            return match server.last_active {
                Some(t) => now - t < Duration::seconds(OFFLINE_GRACE_SECS),
                None => false,
            };
        }

        let src = match self.kind {
            RuleType::Cpu => server.cpu,
            RuleType::Memory => percent(server.mem_used, server.mem_total),
            RuleType::Swap => percent(server.swap_used, server.swap_total),
            RuleType::Disk => percent(server.disk_used, server.disk_total),
            RuleType::NetInSpeed => server.net_in_speed as f64,
            RuleType::NetOutSpeed => server.net_out_speed as f64,
            RuleType::NetAllSpeed => (server.net_in_speed + server.net_out_speed) as f64,
            RuleType::TransferIn => server.net_in_transfer as f64,
            RuleType::TransferOut => server.net_out_transfer as f64,
            RuleType::TransferAll => (server.net_in_transfer + server.net_out_transfer) as f64,
            RuleType::TransferInCycle
            | RuleType::TransferOutCycle
            | RuleType::TransferAllCycle => cycle_usage.unwrap_or(0) as f64,
            RuleType::Load1 => server.load1,
            RuleType::Load5 => server.load5,
            RuleType::Load15 => server.load15,
            RuleType::ProcessCount => server.process_count as f64,
            RuleType::TcpConnCount => server.tcp_conn_count as f64,
            RuleType::UdpConnCount => server.udp_conn_count as f64,
            RuleType::Offline => unreachable!(),
        };

        !self.out_of_range(src)
    }

    fn out_of_range(&self, src: f64) -> bool {
        (self.max > 0.0 && src > self.max) || (self.min > 0.0 && src < self.min)
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 * 100.0 / total as f64
    }
}
