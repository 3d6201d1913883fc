//! Alert-rule model: sub-rule snapshots against server samples and the
//! window-check algorithm that decides when an incident fires. Pure logic,
//! no I/O; the engine loop lives in the server crate.

pub mod cycle;
pub mod rule;

#[cfg(test)]
mod tests;

pub use cycle::CycleTransferStats;
pub use rule::{Rule, RuleCover, RuleType, ServerSnapshot};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerMode {
    /// Notify on every failing check (subject to mute backoff).
    Always,
    /// Notify once per incident, again only after recovery.
    Once,
}

impl TriggerMode {
    pub fn from_i32(v: i32) -> Self {
        if v == 1 {
            TriggerMode::Once
        } else {
            TriggerMode::Always
        }
    }
}

/// An alert rule: an ordered list of sub-rules evaluated per server. The
/// rule as a whole passes while any sub-rule passes.
#[derive(Debug, Clone)]
pub struct AlertRule {
    pub id: u64,
    pub user_id: u64,
    pub name: String,
    pub enabled: bool,
    pub trigger_mode: TriggerMode,
    pub notification_group_id: u64,
    pub rules: Vec<Rule>,
    pub fail_trigger_tasks: Vec<u64>,
    pub recover_trigger_tasks: Vec<u64>,
}

impl AlertRule {
    /// Evaluates every sub-rule against one server at one tick. Entry `i` is
    /// true when the sample satisfies sub-rule `i`. `cycle_usage` supplies
    /// the accumulated transfer for cycle sub-rules, keyed by sub-rule index.
    pub fn snapshot(
        &self,
        server: &ServerSnapshot,
        cycle_usage: &dyn Fn(usize, &Rule) -> Option<u64>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Vec<bool> {
        self.rules
            .iter()
            .enumerate()
            .map(|(i, rule)| rule.snapshot(server, cycle_usage(i, rule), now))
            .collect()
    }

    /// Walks the retained sample history and decides whether the rule still
    /// passes. Returns `(max_duration, passed)`; `max_duration` bounds how
    /// much history the engine needs to keep for this rule.
    ///
    /// Sub-rules are evaluated in order and evaluation stops at the first
    /// passing one; sub-rules never reached contribute no duration.
    pub fn check(&self, points: &[Vec<bool>]) -> (usize, bool) {
        let mut max_duration = 0usize;
        let mut has_passed = false;

        for (idx, rule) in self.rules.iter().enumerate() {
            if has_passed {
                break;
            }

            if rule.is_transfer_cycle() {
                // only the most recent sample matters for cycle limits
                max_duration = max_duration.max(1);
                if points.last().is_some_and(|p| sample(p, idx)) {
                    has_passed = true;
                }
            } else if rule.kind == RuleType::Offline {
                let duration = rule.duration as usize;
                if points.len() < duration {
                    has_passed = true;
                    continue;
                }
                // scan back for the most recent online marker
                let mut seen = 0usize;
                let mut found = false;
                for p in points.iter().rev().take(duration) {
                    seen += 1;
                    if sample(p, idx) {
                        found = true;
                        break;
                    }
                }
                if found {
                    max_duration = max_duration.max(seen);
                    has_passed = true;
                } else {
                    max_duration = max_duration.max(duration);
                    // no marker anywhere: the server was never observed
                    // online, so there is no transition to alert on
                    if !points.iter().any(|p| sample(p, idx)) {
                        has_passed = true;
                    }
                }
            } else {
                let duration = rule.duration as usize;
                if points.len() < duration || duration == 0 {
                    has_passed = true;
                    continue;
                }
                max_duration = max_duration.max(duration);
                let fails = points
                    .iter()
                    .rev()
                    .take(duration)
                    .filter(|p| !sample(p, idx))
                    .count();
                // tolerate transient violations up to 70% of the window
                if fails * 100 / duration <= 70 {
                    has_passed = true;
                }
            }
        }

        (max_duration, has_passed)
    }

    pub fn has_transfer_cycle_rule(&self) -> bool {
        self.rules.iter().any(Rule::is_transfer_cycle)
    }
}

fn sample(point: &[bool], idx: usize) -> bool {
    point.get(idx).copied().unwrap_or(false)
}
