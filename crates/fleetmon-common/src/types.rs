use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::proto;

/// Static host facts reported once per agent connection (and again after a
/// reboot, which is how boot-time jumps are detected).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Host {
    pub platform: String,
    pub platform_version: String,
    pub cpu: Vec<String>,
    pub mem_total: u64,
    pub disk_total: u64,
    pub swap_total: u64,
    pub arch: String,
    pub virtualization: String,
    pub boot_time: u64,
    pub version: String,
    pub gpu: Vec<String>,
}

impl From<proto::Host> for Host {
    fn from(h: proto::Host) -> Self {
        Self {
            platform: h.platform,
            platform_version: h.platform_version,
            cpu: h.cpu,
            mem_total: h.mem_total,
            disk_total: h.disk_total,
            swap_total: h.swap_total,
            arch: h.arch,
            virtualization: h.virtualization,
            boot_time: h.boot_time,
            version: h.version,
            gpu: h.gpu,
        }
    }
}

/// Rolling host state, one frame per reporting interval.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostState {
    pub cpu: f64,
    pub mem_used: u64,
    pub swap_used: u64,
    pub disk_used: u64,
    pub net_in_transfer: u64,
    pub net_out_transfer: u64,
    pub net_in_speed: u64,
    pub net_out_speed: u64,
    pub uptime: u64,
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub tcp_conn_count: u64,
    pub udp_conn_count: u64,
    pub process_count: u64,
}

impl From<proto::State> for HostState {
    fn from(s: proto::State) -> Self {
        Self {
            cpu: s.cpu,
            mem_used: s.mem_used,
            swap_used: s.swap_used,
            disk_used: s.disk_used,
            net_in_transfer: s.net_in_transfer,
            net_out_transfer: s.net_out_transfer,
            net_in_speed: s.net_in_speed,
            net_out_speed: s.net_out_speed,
            uptime: s.uptime,
            load1: s.load1,
            load5: s.load5,
            load15: s.load15,
            tcp_conn_count: s.tcp_conn_count,
            udp_conn_count: s.udp_conn_count,
            process_count: s.process_count,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ip {
    pub ipv4_addr: String,
    pub ipv6_addr: String,
}

impl Ip {
    /// Joined display form: "v4/v6" when both are present, else whichever is.
    pub fn join(&self) -> String {
        match (self.ipv4_addr.is_empty(), self.ipv6_addr.is_empty()) {
            (false, false) => format!("{}/{}", self.ipv4_addr, self.ipv6_addr),
            (false, true) => self.ipv4_addr.clone(),
            (true, false) => self.ipv6_addr.clone(),
            (true, true) => String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoIp {
    pub ip: Ip,
    pub country_code: String,
}

impl From<proto::GeoIp> for GeoIp {
    fn from(g: proto::GeoIp) -> Self {
        let ip = g.ip.unwrap_or_default();
        Self {
            ip: Ip {
                ipv4_addr: ip.ipv4,
                ipv6_addr: ip.ipv6,
            },
            country_code: g.country_code,
        }
    }
}

/// Derived service availability over the current sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ServiceStatus {
    NoData = 1,
    Good = 2,
    LowAvailability = 3,
    Down = 4,
}

impl ServiceStatus {
    /// Availability thresholds: 0% has no data, >95% is good, >80% degraded,
    /// anything below is down.
    pub fn from_percent(percent: u64) -> Self {
        if percent == 0 {
            ServiceStatus::NoData
        } else if percent > 95 {
            ServiceStatus::Good
        } else if percent > 80 {
            ServiceStatus::LowAvailability
        } else {
            ServiceStatus::Down
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::NoData => write!(f, "No Data"),
            ServiceStatus::Good => write!(f, "Good"),
            ServiceStatus::LowAvailability => write!(f, "Low Availability"),
            ServiceStatus::Down => write!(f, "Down"),
        }
    }
}

/// Task/probe kind discriminators carried in `Task.type` / `TaskResult.type`.
pub mod task_type {
    pub const HTTP_GET: u64 = 1;
    pub const ICMP_PING: u64 = 2;
    pub const TCP_PING: u64 = 3;
    pub const COMMAND: u64 = 4;
    pub const TLS: u64 = 5;
    pub const UPGRADE: u64 = 6;
    pub const KEEPALIVE: u64 = 7;
    pub const NAT: u64 = 8;
    pub const REPORT_HOST_INFO: u64 = 9;
    pub const REPORT_CONFIG: u64 = 10;

    /// Probe results that feed the service sentinel's ingest channel.
    pub fn is_sentinel_task(t: u64) -> bool {
        matches!(t, HTTP_GET | ICMP_PING | TCP_PING | TLS)
    }
}

/// Payload of a NAT tunnel instruction, JSON-encoded into `Task.data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatInstruction {
    pub stream_id: String,
    pub host: String,
}

/// A probe sample as retained in the sentinel's sliding window.
#[derive(Debug, Clone)]
pub struct ProbeSample {
    pub successful: bool,
    pub delay: f32,
    pub data: String,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_thresholds() {
        assert_eq!(ServiceStatus::from_percent(0), ServiceStatus::NoData);
        assert_eq!(ServiceStatus::from_percent(100), ServiceStatus::Good);
        assert_eq!(ServiceStatus::from_percent(96), ServiceStatus::Good);
        assert_eq!(
            ServiceStatus::from_percent(95),
            ServiceStatus::LowAvailability
        );
        assert_eq!(
            ServiceStatus::from_percent(81),
            ServiceStatus::LowAvailability
        );
        assert_eq!(ServiceStatus::from_percent(80), ServiceStatus::Down);
        assert_eq!(ServiceStatus::from_percent(1), ServiceStatus::Down);
    }

    #[test]
    fn ip_join_forms() {
        let both = Ip {
            ipv4_addr: "1.2.3.4".into(),
            ipv6_addr: "2001:db8::1".into(),
        };
        assert_eq!(both.join(), "1.2.3.4/2001:db8::1");

        let v4 = Ip {
            ipv4_addr: "1.2.3.4".into(),
            ipv6_addr: String::new(),
        };
        assert_eq!(v4.join(), "1.2.3.4");

        let none = Ip::default();
        assert_eq!(none.join(), "");
    }

    #[test]
    fn sentinel_task_kinds() {
        assert!(task_type::is_sentinel_task(task_type::HTTP_GET));
        assert!(task_type::is_sentinel_task(task_type::TLS));
        assert!(!task_type::is_sentinel_task(task_type::COMMAND));
        assert!(!task_type::is_sentinel_task(task_type::KEEPALIVE));
    }
}
