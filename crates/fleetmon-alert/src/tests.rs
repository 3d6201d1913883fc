use chrono::{Duration, TimeZone, Utc};

use crate::rule::{CycleUnit, Rule, RuleCover, RuleType, ServerSnapshot};
use crate::{AlertRule, TriggerMode};

fn alert(rules: Vec<Rule>) -> AlertRule {
    AlertRule {
        id: 1,
        user_id: 0,
        name: "test".into(),
        enabled: true,
        trigger_mode: TriggerMode::Always,
        notification_group_id: 0,
        rules,
        fail_trigger_tasks: vec![],
        recover_trigger_tasks: vec![],
    }
}

fn rule(kind: RuleType, duration: u64) -> Rule {
    Rule {
        kind,
        min: 0.0,
        max: 0.0,
        duration,
        cover: RuleCover::All,
        ignore: Default::default(),
        cycle_start: None,
        cycle_interval: 1,
        cycle_unit: CycleUnit::Hour,
    }
}

fn general(duration: u64) -> Rule {
    rule(RuleType::Cpu, duration)
}

fn repeat(point: Vec<bool>, count: usize) -> Vec<Vec<bool>> {
    std::iter::repeat_with(|| point.clone()).take(count).collect()
}

#[test]
fn cycle_rule_pass_and_fail() {
    let a = alert(vec![rule(RuleType::TransferInCycle, 0)]);

    // the most recent sample decides
    assert_eq!(a.check(&[vec![false], vec![true]]), (1, true));
    assert_eq!(a.check(&[vec![true], vec![false]]), (1, false));
}

#[test]
fn offline_rule_marker_positions() {
    let a = alert(vec![rule(RuleType::Offline, 10)]);

    // marker at the oldest slot: full window retained
    let mut points = vec![vec![true]];
    points.extend(repeat(vec![false], 9));
    assert_eq!(a.check(&points), (10, true));

    // marker in the middle
    let mut points = repeat(vec![false], 10);
    points[5][0] = true;
    assert_eq!(a.check(&points), (5, true));

    // marker in the newest slot
    let mut points = repeat(vec![false], 10);
    points[9][0] = true;
    assert_eq!(a.check(&points), (1, true));
}

#[test]
fn offline_rule_short_window_passes() {
    let a = alert(vec![rule(RuleType::Offline, 10)]);
    assert_eq!(a.check(&repeat(vec![false], 9)), (0, true));
}

#[test]
fn offline_rule_never_seen_online_passes() {
    let a = alert(vec![rule(RuleType::Offline, 10)]);
    assert_eq!(a.check(&repeat(vec![false], 10)), (10, true));
}

#[test]
fn offline_rule_stale_marker_fails() {
    // marker exists but only beyond the last `duration` samples
    let a = alert(vec![rule(RuleType::Offline, 10)]);
    let mut points = repeat(vec![false], 12);
    points[0][0] = true;
    assert_eq!(a.check(&points), (10, false));
}

#[test]
fn general_rule_thresholds() {
    let a = alert(vec![general(10)]);

    assert_eq!(a.check(&repeat(vec![false], 10)), (10, false));

    let mut points = repeat(vec![false], 8);
    points.extend(repeat(vec![true], 2));
    assert_eq!(a.check(&points), (10, false));

    // exactly 70% failing still passes
    let mut points = repeat(vec![false], 7);
    points.extend(repeat(vec![true], 3));
    assert_eq!(a.check(&points), (10, true));

    let mut points = repeat(vec![false], 4);
    points.extend(repeat(vec![true], 6));
    assert_eq!(a.check(&points), (10, true));
}

#[test]
fn general_rule_short_window_passes() {
    let a = alert(vec![general(10)]);
    assert_eq!(a.check(&repeat(vec![false], 9)), (0, true));
}

#[test]
fn combined_offline_then_general() {
    let a = alert(vec![rule(RuleType::Offline, 10), general(10)]);

    // offline passes on the newest marker; the general sub-rule is skipped
    let mut points = repeat(vec![false, true], 2);
    points.extend(repeat(vec![true, false], 8));
    assert_eq!(a.check(&points), (1, true));

    // offline column has no marker at all, so it passes on its own
    let mut points = repeat(vec![false, false], 2);
    points.extend(repeat(vec![false, true], 8));
    assert_eq!(a.check(&points), (10, true));
}

#[test]
fn combined_general_then_offline() {
    let a = alert(vec![general(10), rule(RuleType::Offline, 10)]);

    let mut points = repeat(vec![false, true], 2);
    points.extend(repeat(vec![true, false], 8));
    assert_eq!(a.check(&points), (10, true));
}

#[test]
fn combined_general_general() {
    let a = alert(vec![general(10), general(30)]);

    let mut points = repeat(vec![false, true], 2);
    points.extend(repeat(vec![false, false], 28));
    assert_eq!(a.check(&points), (30, false));

    // second window not yet full: passes with only the first one counted
    let mut points = repeat(vec![false, true], 2);
    points.extend(repeat(vec![false, false], 27));
    assert_eq!(a.check(&points), (10, true));
}

fn snapshot_server() -> ServerSnapshot {
    ServerSnapshot {
        id: 3,
        name: "db-1".into(),
        cpu: 50.0,
        mem_used: 900,
        mem_total: 1000,
        net_in_speed: 5_000,
        last_active: Some(Utc::now()),
        ..Default::default()
    }
}

fn no_cycle(_: usize, _: &Rule) -> Option<u64> {
    None
}

#[test]
fn snapshot_range_check() {
    let mut cpu = rule(RuleType::Cpu, 5);
    cpu.max = 80.0;
    let a = alert(vec![cpu]);

    let now = Utc::now();
    let mut server = snapshot_server();
    assert_eq!(a.snapshot(&server, &no_cycle, now), vec![true]);

    server.cpu = 95.0;
    assert_eq!(a.snapshot(&server, &no_cycle, now), vec![false]);
}

#[test]
fn snapshot_memory_is_percentage() {
    let mut mem = rule(RuleType::Memory, 5);
    mem.max = 85.0;
    let a = alert(vec![mem]);

    // 900/1000 = 90% > 85%
    assert_eq!(
        a.snapshot(&snapshot_server(), &no_cycle, Utc::now()),
        vec![false]
    );
}

#[test]
fn snapshot_min_bound() {
    let mut speed = rule(RuleType::NetInSpeed, 5);
    speed.min = 10_000.0;
    let a = alert(vec![speed]);

    assert_eq!(
        a.snapshot(&snapshot_server(), &no_cycle, Utc::now()),
        vec![false]
    );
}

#[test]
fn snapshot_offline_marker() {
    let a = alert(vec![rule(RuleType::Offline, 10)]);
    let now = Utc::now();

    let mut server = snapshot_server();
    assert_eq!(a.snapshot(&server, &no_cycle, now), vec![true]);

    server.last_active = Some(now - Duration::seconds(31));
    assert_eq!(a.snapshot(&server, &no_cycle, now), vec![false]);

    server.last_active = None;
    assert_eq!(a.snapshot(&server, &no_cycle, now), vec![false]);
}

#[test]
fn snapshot_cover_filtering() {
    let mut cpu = rule(RuleType::Cpu, 5);
    cpu.max = 10.0;
    cpu.ignore.insert(3, true);
    let a = alert(vec![cpu.clone()]);

    // covered-by-default server 3 is ignored: the violating value is masked
    assert_eq!(
        a.snapshot(&snapshot_server(), &no_cycle, Utc::now()),
        vec![true]
    );

    cpu.cover = RuleCover::IgnoreAll;
    let a = alert(vec![cpu]);
    // only-listed mode: server 3 is listed, so the violation shows
    assert_eq!(
        a.snapshot(&snapshot_server(), &no_cycle, Utc::now()),
        vec![false]
    );
}

#[test]
fn snapshot_cycle_uses_provided_usage() {
    let mut cycle = rule(RuleType::TransferInCycle, 0);
    cycle.max = 1_000.0;
    let a = alert(vec![cycle]);

    let over = |_: usize, _: &Rule| Some(2_000u64);
    let under = |_: usize, _: &Rule| Some(500u64);
    assert_eq!(a.snapshot(&snapshot_server(), &over, Utc::now()), vec![false]);
    assert_eq!(a.snapshot(&snapshot_server(), &under, Utc::now()), vec![true]);
}

#[test]
fn cycle_period_walks_forward_from_anchor() {
    let mut r = rule(RuleType::TransferAllCycle, 0);
    r.cycle_start = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    r.cycle_interval = 1;
    r.cycle_unit = CycleUnit::Month;

    let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
    let (from, to) = r.cycle_period(now);
    assert_eq!(from, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
    assert_eq!(to, Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());
}

#[test]
fn cycle_period_future_anchor() {
    let mut r = rule(RuleType::TransferAllCycle, 0);
    let anchor = Utc::now() + Duration::days(3);
    r.cycle_start = Some(anchor);
    r.cycle_unit = CycleUnit::Day;

    let (from, _) = r.cycle_period(Utc::now());
    assert_eq!(from, anchor);
}

#[test]
fn rule_json_round_trip() {
    let raw = r#"[{"type":"cpu","max":90,"duration":10},
                  {"type":"offline","duration":10},
                  {"type":"transfer_in_cycle","max":1073741824,"cover":1,
                   "ignore":{"2":true},"cycle_start":"2024-01-01T00:00:00Z",
                   "cycle_interval":1,"cycle_unit":"month"}]"#;
    let rules: Vec<Rule> = serde_json::from_str(raw).unwrap();
    assert_eq!(rules.len(), 3);
    assert_eq!(rules[0].kind, RuleType::Cpu);
    assert_eq!(rules[1].kind, RuleType::Offline);
    assert!(rules[2].is_transfer_cycle());
    assert_eq!(rules[2].cover, RuleCover::IgnoreAll);
    assert!(rules[2].covers(2));
    assert!(!rules[2].covers(5));
}
