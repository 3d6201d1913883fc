use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;

use fleetmon_alert::{AlertRule, CycleTransferStats, Rule, RuleType, TriggerMode};
use fleetmon_common::util::ip_desensitize;
use fleetmon_notify::{mute_label, NotificationHub};
use fleetmon_storage::entities::alert_rule;
use fleetmon_storage::Store;

use crate::crontask::CronCoordinator;
use crate::registry::AgentRegistry;
use crate::users::UserIndex;

const WARMUP: Duration = Duration::from_secs(10);
const TICK: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum CheckState {
    #[default]
    NoData,
    Fail,
    Pass,
}

/// Periodic evaluation of alert rules against every visible agent, with
/// de-duplicated incident/recovery notifications and trigger tasks.
pub struct AlertManager {
    alerts: RwLock<Vec<Arc<AlertRule>>>,
    points: Mutex<HashMap<(u64, u64), Vec<Vec<bool>>>>,
    prev_state: Mutex<HashMap<(u64, u64), CheckState>>,
    cycle_stats: Mutex<HashMap<u64, CycleTransferStats>>,
    plain_ip_in_notification: bool,

    store: Store,
    registry: Arc<AgentRegistry>,
    hub: Arc<NotificationHub>,
    crontask: Arc<CronCoordinator>,
    users: Arc<UserIndex>,
}

impl AlertManager {
    pub async fn load(
        store: Store,
        registry: Arc<AgentRegistry>,
        hub: Arc<NotificationHub>,
        crontask: Arc<CronCoordinator>,
        users: Arc<UserIndex>,
        plain_ip_in_notification: bool,
    ) -> crate::error::Result<Arc<Self>> {
        let manager = Arc::new(Self {
            alerts: RwLock::new(Vec::new()),
            points: Mutex::new(HashMap::new()),
            prev_state: Mutex::new(HashMap::new()),
            cycle_stats: Mutex::new(HashMap::new()),
            plain_ip_in_notification,
            store,
            registry,
            hub,
            crontask,
            users,
        });

        let rules: Vec<Arc<AlertRule>> = manager
            .store
            .list_alert_rules()
            .await?
            .into_iter()
            .map(|m| Arc::new(parse_alert_rule(m)))
            .collect();
        let now = Utc::now();
        {
            let mut stats = manager.cycle_stats.lock().unwrap();
            for alert in rules.iter().filter(|a| a.enabled) {
                if let Some(cs) = CycleTransferStats::from_alert(alert, now) {
                    stats.insert(alert.id, cs);
                }
            }
        }
        *manager.alerts.write().unwrap() = rules;
        Ok(manager)
    }

    pub fn list(&self) -> Vec<Arc<AlertRule>> {
        self.alerts.read().unwrap().clone()
    }

    /// Inserts or replaces a rule, resetting its evaluation history.
    pub fn on_update(&self, alert: AlertRule) {
        let id = alert.id;
        self.points.lock().unwrap().retain(|(aid, _), _| *aid != id);
        self.prev_state.lock().unwrap().retain(|(aid, _), _| *aid != id);
        {
            let mut stats = self.cycle_stats.lock().unwrap();
            stats.remove(&id);
            if alert.enabled {
                if let Some(cs) = CycleTransferStats::from_alert(&alert, Utc::now()) {
                    stats.insert(id, cs);
                }
            }
        }
        let mut alerts = self.alerts.write().unwrap();
        match alerts.iter_mut().find(|a| a.id == id) {
            Some(slot) => *slot = Arc::new(alert),
            None => alerts.push(Arc::new(alert)),
        }
    }

    pub fn on_delete(&self, ids: &[u64]) {
        let mut alerts = self.alerts.write().unwrap();
        alerts.retain(|a| !ids.contains(&a.id));
        let mut points = self.points.lock().unwrap();
        let mut prev = self.prev_state.lock().unwrap();
        let mut stats = self.cycle_stats.lock().unwrap();
        for id in ids {
            points.retain(|(aid, _), _| aid != id);
            prev.retain(|(aid, _), _| aid != id);
            stats.remove(id);
        }
    }

    /// Drops per-server evaluation state when servers are deleted.
    pub fn forget_servers(&self, server_ids: &[u64]) {
        self.points
            .lock()
            .unwrap()
            .retain(|(_, sid), _| !server_ids.contains(sid));
        self.prev_state
            .lock()
            .unwrap()
            .retain(|(_, sid), _| !server_ids.contains(sid));
        let mut stats = self.cycle_stats.lock().unwrap();
        for cs in stats.values_mut() {
            for sid in server_ids {
                cs.forget_server(*sid);
            }
        }
    }

    /// Cycle-transfer view for the dashboard.
    pub fn cycle_transfer_stats(&self) -> HashMap<u64, CycleTransferStats> {
        self.cycle_stats.lock().unwrap().clone()
    }

    /// The evaluation loop: a warmup pause, then one pass every three
    /// seconds.
    pub async fn run(self: Arc<Self>) {
        tokio::time::sleep(WARMUP).await;
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    async fn tick(&self) {
        let now = Utc::now();
        let alerts = self.list();
        let agents = self.registry.list();

        for alert in alerts.iter().filter(|a| a.enabled) {
            for (server_id, agent) in &agents {
                let meta = agent.meta();
                // visibility: rule owner must own the server or be an admin
                if alert.user_id != meta.user_id && !self.users.is_admin(alert.user_id) {
                    continue;
                }

                let cycle_usage = self.cycle_usages(alert, *server_id, &meta.name, now).await;
                let snapshot = agent.alert_snapshot();
                let point = alert.snapshot(
                    &snapshot,
                    &|idx, _rule| cycle_usage.get(&idx).copied(),
                    now,
                );

                let key = (alert.id, *server_id);
                let passed = {
                    let mut points = self.points.lock().unwrap();
                    let history = points.entry(key).or_default();
                    history.push(point);
                    let (max_duration, passed) = alert.check(history);
                    if max_duration > 0 && max_duration < history.len() {
                        let start = history.len() - max_duration;
                        history.drain(..start);
                    }
                    passed
                };

                self.transition(alert, agent, passed).await;
            }
        }
    }

    /// Resolves the accumulated cycle usage per transfer-cycle sub-rule,
    /// throttled through the stats entry's `next_update` schedule.
    async fn cycle_usages(
        &self,
        alert: &AlertRule,
        server_id: u64,
        server_name: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> HashMap<usize, u64> {
        let mut usages = HashMap::new();
        for (idx, rule) in alert.rules.iter().enumerate() {
            if !rule.is_transfer_cycle() || !rule.covers(server_id) {
                continue;
            }

            let due = {
                let stats = self.cycle_stats.lock().unwrap();
                match stats.get(&alert.id) {
                    Some(cs) => cs.is_due(server_id, now),
                    None => true,
                }
            };
            if !due {
                let cached = self
                    .cycle_stats
                    .lock()
                    .unwrap()
                    .get(&alert.id)
                    .and_then(|cs| cs.cached(server_id));
                if let Some(v) = cached {
                    usages.insert(idx, v);
                    continue;
                }
            }

            let usage = self.query_cycle_usage(rule, server_id, now).await;
            let mut stats = self.cycle_stats.lock().unwrap();
            let entry = stats.entry(alert.id).or_insert_with(|| {
                CycleTransferStats::from_alert(alert, now).unwrap_or(CycleTransferStats {
                    name: alert.name.clone(),
                    from: now,
                    to: now,
                    max: rule.max as u64,
                    min: rule.min as u64,
                    server_name: HashMap::new(),
                    transfer: HashMap::new(),
                    next_update: HashMap::new(),
                })
            });
            entry.record(rule, server_id, server_name, usage, now);
            usages.insert(idx, usage);
        }
        usages
    }

    /// Persisted rows since cycle start plus the live, not-yet-snapshotted
    /// delta.
    async fn query_cycle_usage(
        &self,
        rule: &Rule,
        server_id: u64,
        now: chrono::DateTime<chrono::Utc>,
    ) -> u64 {
        let (from, _) = rule.cycle_period(now);
        let (db_in, db_out) = self
            .store
            .transfer_usage_since(server_id, from)
            .await
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, server_id, "cycle usage query failed");
                (0, 0)
            });
        let (live_in, live_out) = self
            .registry
            .get(server_id)
            .map(|a| a.unsnapshotted_transfer())
            .unwrap_or((0, 0));

        match rule.kind {
            RuleType::TransferInCycle => db_in + live_in,
            RuleType::TransferOutCycle => db_out + live_out,
            _ => db_in + live_in + db_out + live_out,
        }
    }

    /// Applies the pass/fail verdict: incident on entering Fail (or on every
    /// failing tick in always-trigger mode), recovery on Fail -> Pass.
    async fn transition(&self, alert: &Arc<AlertRule>, agent: &Arc<crate::registry::Agent>, passed: bool) {
        let key = (alert.id, agent.id);
        let prev = {
            let prev_state = self.prev_state.lock().unwrap();
            prev_state.get(&key).copied().unwrap_or_default()
        };

        if !passed {
            if alert.trigger_mode == TriggerMode::Always || prev != CheckState::Fail {
                self.prev_state.lock().unwrap().insert(key, CheckState::Fail);

                let ip = self.display_ip(&agent.geoip().ip.join());
                let message = format!(
                    "[Incident] {}({}) {}",
                    agent.meta().name,
                    ip,
                    alert.name
                );
                self.crontask
                    .send_trigger_tasks(&alert.fail_trigger_tasks, agent.id);

                let context = agent.notification_context();
                let incident = mute_label::server_incident(alert.id, agent.id);
                let resolved = mute_label::server_incident_resolved(alert.id, agent.id);
                let hub = self.hub.clone();
                let group_id = alert.notification_group_id;
                hub.unmute_notification(group_id, &resolved);
                tokio::spawn(async move {
                    hub.send_notification(group_id, &message, Some(&incident), Some(&context))
                        .await;
                });
            }
        } else {
            if prev == CheckState::Fail {
                let ip = self.display_ip(&agent.geoip().ip.join());
                let message = format!(
                    "[Resolved] {}({}) {}",
                    agent.meta().name,
                    ip,
                    alert.name
                );
                self.crontask
                    .send_trigger_tasks(&alert.recover_trigger_tasks, agent.id);

                let context = agent.notification_context();
                let incident = mute_label::server_incident(alert.id, agent.id);
                let resolved = mute_label::server_incident_resolved(alert.id, agent.id);
                let hub = self.hub.clone();
                let group_id = alert.notification_group_id;
                hub.unmute_notification(group_id, &incident);
                tokio::spawn(async move {
                    hub.send_notification(group_id, &message, Some(&resolved), Some(&context))
                        .await;
                });
            }
            self.prev_state.lock().unwrap().insert(key, CheckState::Pass);
        }
    }

    fn display_ip(&self, ip: &str) -> String {
        if self.plain_ip_in_notification {
            ip.to_owned()
        } else {
            ip_desensitize(ip)
        }
    }
}

/// Builds the domain rule out of its storage row; malformed raw columns
/// degrade to empty lists rather than poisoning the whole table.
pub fn parse_alert_rule(m: alert_rule::Model) -> AlertRule {
    AlertRule {
        id: m.id as u64,
        user_id: m.user_id as u64,
        name: m.name,
        enabled: m.enable,
        trigger_mode: TriggerMode::from_i32(m.trigger_mode),
        notification_group_id: m.notification_group_id as u64,
        rules: serde_json::from_str(&m.rules_raw).unwrap_or_default(),
        fail_trigger_tasks: serde_json::from_str(&m.fail_trigger_tasks_raw).unwrap_or_default(),
        recover_trigger_tasks: serde_json::from_str(&m.recover_trigger_tasks_raw)
            .unwrap_or_default(),
    }
}
