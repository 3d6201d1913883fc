use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use fleetmon_common::types::{Host, HostState, Ip};

/// Server fields exposed to payload templates.
#[derive(Debug, Clone, Default)]
pub struct ServerContext {
    pub id: u64,
    pub name: String,
    pub host: Host,
    pub state: HostState,
    pub ip: Ip,
}

/// Expands the `#...#` placeholders in `template`. `escape` is applied to
/// every substituted value (never to the surrounding template text) so the
/// same table serves URL, JSON and form rendering.
pub fn render(
    template: &str,
    message: &str,
    server: Option<&ServerContext>,
    now: DateTime<Utc>,
    location: Tz,
    escape: &dyn Fn(&str) -> String,
) -> String {
    let mut pairs: Vec<(&str, String)> = vec![
        ("#FM#", message.to_string()),
        (
            "#DATETIME#",
            now.with_timezone(&location)
                .format("%Y-%m-%d %H:%M:%S %z")
                .to_string(),
        ),
    ];

    if let Some(s) = server {
        let (ipv4, ipv6) = (s.ip.ipv4_addr.clone(), s.ip.ipv6_addr.clone());
        let valid_ip = if !ipv4.is_empty() { ipv4.clone() } else { ipv6.clone() };
        pairs.extend([
            ("#SERVER.NAME#", s.name.clone()),
            ("#SERVER.ID#", s.id.to_string()),
            ("#SERVER.CPU#", format!("{:.2}", s.state.cpu)),
            ("#SERVER.MEM#", s.state.mem_used.to_string()),
            ("#SERVER.SWAP#", s.state.swap_used.to_string()),
            ("#SERVER.DISK#", s.state.disk_used.to_string()),
            ("#SERVER.MEMUSED#", s.state.mem_used.to_string()),
            ("#SERVER.SWAPUSED#", s.state.swap_used.to_string()),
            ("#SERVER.DISKUSED#", s.state.disk_used.to_string()),
            ("#SERVER.MEMTOTAL#", s.host.mem_total.to_string()),
            ("#SERVER.SWAPTOTAL#", s.host.swap_total.to_string()),
            ("#SERVER.DISKTOTAL#", s.host.disk_total.to_string()),
            ("#SERVER.NETINSPEED#", s.state.net_in_speed.to_string()),
            ("#SERVER.NETOUTSPEED#", s.state.net_out_speed.to_string()),
            ("#SERVER.NETINTRANSFER#", s.state.net_in_transfer.to_string()),
            ("#SERVER.NETOUTTRANSFER#", s.state.net_out_transfer.to_string()),
            ("#SERVER.TRANSFERIN#", s.state.net_in_transfer.to_string()),
            ("#SERVER.TRANSFEROUT#", s.state.net_out_transfer.to_string()),
            ("#SERVER.LOAD1#", format!("{:.2}", s.state.load1)),
            ("#SERVER.LOAD5#", format!("{:.2}", s.state.load5)),
            ("#SERVER.LOAD15#", format!("{:.2}", s.state.load15)),
            ("#SERVER.TCPCONNCOUNT#", s.state.tcp_conn_count.to_string()),
            ("#SERVER.UDPCONNCOUNT#", s.state.udp_conn_count.to_string()),
            ("#SERVER.IP#", valid_ip),
            ("#SERVER.IPV4#", ipv4),
            ("#SERVER.IPV6#", ipv6),
        ]);
    }

    // Longest placeholder first so e.g. #SERVER.MEMTOTAL# is never clipped
    // by #SERVER.MEM#.
    pairs.sort_by_key(|(k, _)| std::cmp::Reverse(k.len()));

    let mut out = template.to_string();
    for (key, value) in &pairs {
        if out.contains(key) {
            out = out.replace(key, &escape(value));
        }
    }
    out
}

pub fn no_escape(s: &str) -> String {
    s.to_string()
}

/// Escaping for values substituted into a URL query.
pub fn url_escape(s: &str) -> String {
    percent_encoding::utf8_percent_encode(s, percent_encoding::NON_ALPHANUMERIC).to_string()
}

/// Escaping for values substituted inside a JSON string literal: the JSON
/// encoding of the string without its surrounding quotes.
pub fn json_escape(s: &str) -> String {
    let quoted = serde_json::to_string(s).unwrap_or_default();
    quoted[1..quoted.len() - 1].to_string()
}
