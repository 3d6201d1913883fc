use chrono::{Duration, TimeZone, Utc};
use chrono_tz::Tz;

use fleetmon_common::types::{Host, HostState, Ip};

use crate::mute::{mute_label, MuteCache};
use crate::template::{json_escape, no_escape, render, url_escape, ServerContext};

fn shanghai() -> Tz {
    "Asia/Shanghai".parse().unwrap()
}

fn sample_server() -> ServerContext {
    ServerContext {
        id: 5,
        name: "edge-hk-1".into(),
        host: Host {
            mem_total: 8192,
            swap_total: 1024,
            disk_total: 81920,
            ..Host::default()
        },
        state: HostState {
            cpu: 42.5,
            mem_used: 4096,
            net_in_transfer: 123456,
            load1: 1.5,
            tcp_conn_count: 17,
            ..HostState::default()
        },
        ip: Ip {
            ipv4_addr: "198.51.100.4".into(),
            ipv6_addr: String::new(),
        },
    }
}

#[test]
fn render_substitutes_message_and_server_fields() {
    let out = render(
        "msg=#FM# name=#SERVER.NAME# id=#SERVER.ID# cpu=#SERVER.CPU# conn=#SERVER.TCPCONNCOUNT#",
        "cpu high",
        Some(&sample_server()),
        Utc::now(),
        shanghai(),
        &no_escape,
    );
    assert_eq!(out, "msg=cpu high name=edge-hk-1 id=5 cpu=42.50 conn=17");
}

#[test]
fn render_longest_placeholder_wins() {
    let out = render(
        "#SERVER.MEMTOTAL#/#SERVER.MEM#",
        "",
        Some(&sample_server()),
        Utc::now(),
        shanghai(),
        &no_escape,
    );
    assert_eq!(out, "8192/4096");
}

#[test]
fn render_ip_fallbacks() {
    let mut server = sample_server();
    server.ip = Ip {
        ipv4_addr: String::new(),
        ipv6_addr: "2001:db8::7".into(),
    };
    let out = render(
        "#SERVER.IP# #SERVER.IPV4# #SERVER.IPV6#",
        "",
        Some(&server),
        Utc::now(),
        shanghai(),
        &no_escape,
    );
    assert_eq!(out, "2001:db8::7  2001:db8::7");
}

#[test]
fn render_datetime_uses_location() {
    let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
    let out = render("#DATETIME#", "", None, now, shanghai(), &no_escape);
    // UTC midnight is 08:00 in Shanghai
    assert!(out.starts_with("2024-05-01 08:00:00"), "got {out}");
}

#[test]
fn url_escaping_applies_to_values_only() {
    let out = render(
        "https://example.com/ping?text=#FM#",
        "disk 90% full",
        None,
        Utc::now(),
        shanghai(),
        &url_escape,
    );
    assert_eq!(out, "https://example.com/ping?text=disk%2090%25%20full");
}

#[test]
fn json_escaping_preserves_literal_validity() {
    let out = render(
        r##"{"text":"#FM#"}"##,
        "line1\nline2 \"quoted\"",
        None,
        Utc::now(),
        shanghai(),
        &json_escape,
    );
    let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert_eq!(parsed["text"], "line1\nline2 \"quoted\"");
}

#[test]
fn backoff_first_send_passes_then_mutes() {
    let cache = MuteCache::new();
    let t0 = Utc::now();

    assert!(cache.should_send("bf::ssc-1:ops", t0));
    assert!(!cache.should_send("bf::ssc-1:ops", t0 + Duration::minutes(5)));
    // a different label is unaffected
    assert!(cache.should_send("bf::ssc-2:ops", t0));
}

#[test]
fn backoff_doubles_and_caps() {
    let cache = MuteCache::new();
    let mut t = Utc::now();
    let label = "bf::sei-3-4:ops";

    assert!(cache.should_send(label, t));
    let mut prev_window = cache.muted_until(label).unwrap() - t;
    assert_eq!(prev_window, Duration::minutes(15));

    // each pass after expiry doubles the window, monotonically, up to 24 h
    for _ in 0..10 {
        t = cache.muted_until(label).unwrap() + Duration::seconds(1);
        assert!(cache.should_send(label, t));
        let window = cache.muted_until(label).unwrap() - t;
        assert!(window >= prev_window);
        assert!(window <= Duration::hours(24));
        prev_window = window;
    }
    assert_eq!(prev_window, Duration::hours(24));
}

#[test]
fn unmute_resets_backoff() {
    let cache = MuteCache::new();
    let t0 = Utc::now();
    let label = "bf::sln-9:ops";

    assert!(cache.should_send(label, t0));
    assert!(!cache.should_send(label, t0 + Duration::minutes(1)));

    cache.unmute(label);
    assert!(cache.should_send(label, t0 + Duration::minutes(2)));
}

#[test]
fn stale_entries_are_evicted_and_start_over() {
    let cache = MuteCache::new();
    let t0 = Utc::now();
    let label = "bf::ic-2:ops";

    assert!(cache.should_send(label, t0));
    // well past until + grace: the entry has expired, so backoff restarts
    let later = t0 + Duration::hours(2);
    assert!(cache.should_send(label, later));
    assert_eq!(
        cache.muted_until(label).unwrap() - later,
        Duration::minutes(15)
    );
}

#[test]
fn label_formats() {
    assert_eq!(mute_label::ip_changed(3), "bf::ic-3");
    assert_eq!(mute_label::server_incident(7, 2), "bf::sei-7-2");
    assert_eq!(mute_label::server_incident_resolved(7, 2), "bf::seir-7-2");
    assert_eq!(mute_label::service_latency_min(1), "bf::sln-1");
    assert_eq!(mute_label::service_latency_max(1), "bf::slm-1");
    assert_eq!(mute_label::service_state_changed(4), "bf::ssc-4");
    assert_eq!(mute_label::service_tls(4, "network"), "bf::stls-4-network");
    assert_eq!(mute_label::with_group("bf::ic-3", "ops"), "bf::ic-3:ops");
}
