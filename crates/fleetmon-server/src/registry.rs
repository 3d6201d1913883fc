use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use fleetmon_alert::ServerSnapshot;
use fleetmon_common::proto;
use fleetmon_common::types::{GeoIp, Host, HostState};
use fleetmon_notify::ServerContext;
use fleetmon_storage::entities::server;

/// Persisted/admin-editable agent fields.
#[derive(Debug, Clone, Default)]
pub struct AgentMeta {
    pub user_id: u64,
    pub name: String,
    pub display_index: i64,
    pub hide_for_guest: bool,
    pub enable_ddns: bool,
    pub ddns_profiles: Vec<u64>,
    pub override_ddns_domains: HashMap<u64, Vec<String>>,
}

impl AgentMeta {
    pub fn from_model(m: &server::Model) -> Self {
        Self {
            user_id: m.user_id as u64,
            name: m.name.clone(),
            display_index: m.display_index,
            hide_for_guest: m.hide_for_guest,
            enable_ddns: m.enable_ddns,
            ddns_profiles: serde_json::from_str(&m.ddns_profiles_raw).unwrap_or_default(),
            override_ddns_domains: serde_json::from_str(&m.override_ddns_domains_raw)
                .unwrap_or_default(),
        }
    }
}

/// Live-only agent fields, never persisted.
#[derive(Debug, Clone, Default)]
pub struct AgentLive {
    pub host: Host,
    pub state: HostState,
    pub geoip: GeoIp,
    pub last_active: Option<DateTime<Utc>>,
    pub prev_transfer_in_snapshot: u64,
    pub prev_transfer_out_snapshot: u64,
}

type TaskSender = mpsc::UnboundedSender<proto::Task>;
type ConfigReply = std::result::Result<String, String>;

/// One connected (or known) agent. Live fields sit behind their own locks so
/// an admin update replacing the meta never loses them.
pub struct Agent {
    pub id: u64,
    pub uuid: String,
    meta: RwLock<AgentMeta>,
    live: Mutex<AgentLive>,
    task_stream: Mutex<Option<TaskSender>>,
    config_tx: mpsc::Sender<ConfigReply>,
    config_rx: tokio::sync::Mutex<mpsc::Receiver<ConfigReply>>,
}

impl Agent {
    pub fn new(id: u64, uuid: String, meta: AgentMeta) -> Self {
        let (config_tx, config_rx) = mpsc::channel(1);
        Self {
            id,
            uuid,
            meta: RwLock::new(meta),
            live: Mutex::new(AgentLive::default()),
            task_stream: Mutex::new(None),
            config_tx,
            config_rx: tokio::sync::Mutex::new(config_rx),
        }
    }

    pub fn from_model(m: &server::Model) -> Self {
        Self::new(m.id as u64, m.uuid.clone(), AgentMeta::from_model(m))
    }

    pub fn meta(&self) -> AgentMeta {
        self.meta.read().unwrap().clone()
    }

    pub fn apply_meta(&self, meta: AgentMeta) {
        *self.meta.write().unwrap() = meta;
    }

    pub fn live(&self) -> AgentLive {
        self.live.lock().unwrap().clone()
    }

    pub fn last_active(&self) -> Option<DateTime<Utc>> {
        self.live.lock().unwrap().last_active
    }

    /// Installs the send side of a freshly opened task stream. Any previous
    /// handle is retired implicitly; its stream ends when the old connection
    /// closes.
    pub fn set_task_stream(&self, tx: TaskSender) {
        *self.task_stream.lock().unwrap() = Some(tx);
    }

    pub fn has_task_stream(&self) -> bool {
        self.task_stream
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Sends a task down the live stream. Returns false when no stream is
    /// connected (the caller decides whether that warrants a notification).
    pub fn send_task(&self, task: proto::Task) -> bool {
        let guard = self.task_stream.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx.send(task).is_ok(),
            None => false,
        }
    }

    /// Applies one state report: refreshes liveness and, when the transfer
    /// snapshots are unset (fresh dashboard or post-reboot reset), seeds them
    /// from the cumulative counters.
    pub fn record_state(&self, state: HostState, now: DateTime<Utc>) {
        let mut live = self.live.lock().unwrap();
        live.last_active = Some(now);
        if live.prev_transfer_in_snapshot == 0 && live.prev_transfer_out_snapshot == 0 {
            live.prev_transfer_in_snapshot = state.net_in_transfer;
            live.prev_transfer_out_snapshot = state.net_out_transfer;
        }
        live.state = state;
    }

    /// Applies a host report. When the boot time moved forward on an agent
    /// that was already reporting, the traffic accumulated since the last
    /// hourly point is returned for immediate persistence and both
    /// snapshots reset, so the next state report re-seeds them.
    pub fn record_host(&self, host: Host) -> Option<(u64, u64)> {
        let mut live = self.live.lock().unwrap();
        let rebooted = live.host.boot_time > 0
            && host.boot_time > live.host.boot_time
            && live.last_active.is_some();
        let flush = if rebooted {
            let tx_in = live
                .state
                .net_in_transfer
                .saturating_sub(live.prev_transfer_in_snapshot);
            let tx_out = live
                .state
                .net_out_transfer
                .saturating_sub(live.prev_transfer_out_snapshot);
            live.prev_transfer_in_snapshot = 0;
            live.prev_transfer_out_snapshot = 0;
            Some((tx_in, tx_out))
        } else {
            None
        };
        live.host = host;
        flush
    }

    pub fn set_geoip(&self, geoip: GeoIp) {
        self.live.lock().unwrap().geoip = geoip;
    }

    pub fn geoip(&self) -> GeoIp {
        self.live.lock().unwrap().geoip.clone()
    }

    /// Advances the hourly snapshot and returns the delta since the last
    /// point; `None` when nothing accumulated.
    pub fn take_transfer_delta(&self) -> Option<(u64, u64)> {
        let mut live = self.live.lock().unwrap();
        let tx_in = live
            .state
            .net_in_transfer
            .saturating_sub(live.prev_transfer_in_snapshot);
        let tx_out = live
            .state
            .net_out_transfer
            .saturating_sub(live.prev_transfer_out_snapshot);
        if tx_in == 0 && tx_out == 0 {
            return None;
        }
        live.prev_transfer_in_snapshot = live.state.net_in_transfer;
        live.prev_transfer_out_snapshot = live.state.net_out_transfer;
        Some((tx_in, tx_out))
    }

    /// Queues a config-fetch reply; a single slot, so a stale reply never
    /// overwrites a fresh request's answer.
    pub fn offer_config_reply(&self, reply: ConfigReply) {
        let _ = self.config_tx.try_send(reply);
    }

    /// Waits for the agent to answer a config fetch.
    pub async fn await_config_reply(
        &self,
        timeout: std::time::Duration,
    ) -> Option<ConfigReply> {
        let mut rx = self.config_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Sample handed to the alert engine.
    pub fn alert_snapshot(&self) -> ServerSnapshot {
        let meta = self.meta.read().unwrap();
        let live = self.live.lock().unwrap();
        ServerSnapshot {
            id: self.id,
            name: meta.name.clone(),
            cpu: live.state.cpu,
            mem_used: live.state.mem_used,
            mem_total: live.host.mem_total,
            swap_used: live.state.swap_used,
            swap_total: live.host.swap_total,
            disk_used: live.state.disk_used,
            disk_total: live.host.disk_total,
            net_in_speed: live.state.net_in_speed,
            net_out_speed: live.state.net_out_speed,
            net_in_transfer: live.state.net_in_transfer,
            net_out_transfer: live.state.net_out_transfer,
            load1: live.state.load1,
            load5: live.state.load5,
            load15: live.state.load15,
            process_count: live.state.process_count,
            tcp_conn_count: live.state.tcp_conn_count,
            udp_conn_count: live.state.udp_conn_count,
            last_active: live.last_active,
        }
    }

    /// Unpersisted traffic since the last hourly point, for cycle rules.
    pub fn unsnapshotted_transfer(&self) -> (u64, u64) {
        let live = self.live.lock().unwrap();
        (
            live.state
                .net_in_transfer
                .saturating_sub(live.prev_transfer_in_snapshot),
            live.state
                .net_out_transfer
                .saturating_sub(live.prev_transfer_out_snapshot),
        )
    }

    /// Context for notification payload templates.
    pub fn notification_context(&self) -> ServerContext {
        let meta = self.meta.read().unwrap();
        let live = self.live.lock().unwrap();
        ServerContext {
            id: self.id,
            name: meta.name.clone(),
            host: live.host.clone(),
            state: live.state.clone(),
            ip: live.geoip.ip.clone(),
        }
    }
}

#[derive(Default)]
struct AgentTable {
    by_id: HashMap<u64, Arc<Agent>>,
    uuid_to_id: HashMap<String, u64>,
}

#[derive(Default)]
struct SortedLists {
    all: Vec<Arc<Agent>>,
    for_guest: Vec<Arc<Agent>>,
}

/// Authoritative in-memory map of known agents. Two locks: the table itself
/// and the materialized sort orders, rebuilt on every mutation.
#[derive(Default)]
pub struct AgentRegistry {
    table: RwLock<AgentTable>,
    sorted: RwLock<SortedLists>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(models: &[server::Model]) -> Self {
        let registry = Self::new();
        {
            let mut table = registry.table.write().unwrap();
            for m in models {
                let agent = Arc::new(Agent::from_model(m));
                table.uuid_to_id.insert(agent.uuid.clone(), agent.id);
                table.by_id.insert(agent.id, agent);
            }
        }
        registry.rebuild_sorted();
        registry
    }

    pub fn get(&self, id: u64) -> Option<Arc<Agent>> {
        self.table.read().unwrap().by_id.get(&id).cloned()
    }

    pub fn uuid_to_id(&self, uuid: &str) -> Option<u64> {
        self.table.read().unwrap().uuid_to_id.get(uuid).copied()
    }

    pub fn list(&self) -> HashMap<u64, Arc<Agent>> {
        self.table.read().unwrap().by_id.clone()
    }

    pub fn count(&self) -> usize {
        self.table.read().unwrap().by_id.len()
    }

    /// Read-locked iteration; the callback returns false to stop early.
    pub fn range(&self, mut f: impl FnMut(&Arc<Agent>) -> bool) {
        let table = self.table.read().unwrap();
        for agent in table.by_id.values() {
            if !f(agent) {
                break;
            }
        }
    }

    pub fn sorted_list(&self) -> Vec<Arc<Agent>> {
        self.sorted.read().unwrap().all.clone()
    }

    pub fn sorted_list_for_guest(&self) -> Vec<Arc<Agent>> {
        self.sorted.read().unwrap().for_guest.clone()
    }

    /// Inserts a brand-new agent (first connection of an unknown UUID).
    pub fn insert(&self, agent: Arc<Agent>) {
        {
            let mut table = self.table.write().unwrap();
            table.uuid_to_id.insert(agent.uuid.clone(), agent.id);
            table.by_id.insert(agent.id, agent);
        }
        self.rebuild_sorted();
    }

    /// Applies an updated meta to a known agent, or registers it if absent.
    /// A live agent keeps its host/state/geoip/stream fields untouched, so
    /// updating twice with identical input is idempotent.
    pub fn update(&self, id: u64, uuid: &str, meta: AgentMeta) {
        {
            let mut table = self.table.write().unwrap();
            match table.by_id.get(&id) {
                Some(agent) => agent.apply_meta(meta),
                None => {
                    let agent = Arc::new(Agent::new(id, uuid.to_owned(), meta));
                    table.by_id.insert(id, agent);
                }
            }
            if !uuid.is_empty() {
                table.uuid_to_id.insert(uuid.to_owned(), id);
            }
        }
        self.rebuild_sorted();
    }

    pub fn delete(&self, ids: &[u64]) {
        {
            let mut table = self.table.write().unwrap();
            for id in ids {
                if let Some(agent) = table.by_id.remove(id) {
                    table.uuid_to_id.remove(&agent.uuid);
                }
            }
        }
        self.rebuild_sorted();
    }

    /// Rebuilds both sort orders: prioritized agents (display_index > 0)
    /// first, higher index first, id ascending as the tiebreaker.
    fn rebuild_sorted(&self) {
        let mut all: Vec<Arc<Agent>> = {
            let table = self.table.read().unwrap();
            table.by_id.values().cloned().collect()
        };
        all.sort_by(|a, b| {
            let (ia, ib) = (a.meta().display_index, b.meta().display_index);
            ib.cmp(&ia).then(a.id.cmp(&b.id))
        });
        let for_guest = all
            .iter()
            .filter(|a| !a.meta().hide_for_guest)
            .cloned()
            .collect();

        let mut sorted = self.sorted.write().unwrap();
        sorted.all = all;
        sorted.for_guest = for_guest;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, user_id: u64) -> AgentMeta {
        AgentMeta {
            user_id,
            name: name.into(),
            ..AgentMeta::default()
        }
    }

    fn registry_with(agents: &[(u64, &str, i64, bool)]) -> AgentRegistry {
        let registry = AgentRegistry::new();
        for (id, uuid, display_index, hide) in agents {
            let mut m = meta(&format!("srv-{id}"), 1);
            m.display_index = *display_index;
            m.hide_for_guest = *hide;
            registry.insert(Arc::new(Agent::new(*id, (*uuid).to_owned(), m)));
        }
        registry
    }

    #[test]
    fn uuid_mapping_tracks_membership() {
        let registry = registry_with(&[(1, "aa", 0, false), (2, "bb", 0, false)]);

        assert_eq!(registry.uuid_to_id("aa"), Some(1));
        assert_eq!(registry.uuid_to_id("bb"), Some(2));
        for (id, agent) in registry.list() {
            assert_eq!(registry.uuid_to_id(&agent.uuid), Some(id));
        }

        registry.delete(&[1]);
        assert_eq!(registry.uuid_to_id("aa"), None);
        assert!(registry.get(1).is_none());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn sort_order_prioritizes_display_index() {
        let registry = registry_with(&[
            (1, "a", 0, false),
            (2, "b", 5, false),
            (3, "c", 5, false),
            (4, "d", 9, false),
            (5, "e", 0, false),
        ]);

        let order: Vec<u64> = registry.sorted_list().iter().map(|a| a.id).collect();
        assert_eq!(order, vec![4, 2, 3, 1, 5]);
    }

    #[test]
    fn guest_list_filters_hidden() {
        let registry = registry_with(&[(1, "a", 0, true), (2, "b", 0, false)]);

        let guest: Vec<u64> = registry
            .sorted_list_for_guest()
            .iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(guest, vec![2]);
        // the full list is a permutation of the table
        assert_eq!(registry.sorted_list().len(), registry.count());
    }

    #[test]
    fn update_preserves_live_fields() {
        let registry = registry_with(&[(1, "aa", 0, false)]);
        let agent = registry.get(1).unwrap();

        let mut state = HostState::default();
        state.net_in_transfer = 1000;
        agent.record_state(state, Utc::now());
        assert!(agent.last_active().is_some());

        let mut new_meta = meta("renamed", 1);
        new_meta.display_index = 3;
        registry.update(1, "aa", new_meta.clone());
        registry.update(1, "aa", new_meta);

        let agent = registry.get(1).unwrap();
        assert_eq!(agent.meta().name, "renamed");
        assert!(agent.last_active().is_some());
        assert_eq!(agent.live().state.net_in_transfer, 1000);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn state_report_seeds_snapshots_once() {
        let agent = Agent::new(1, "aa".into(), meta("srv", 1));

        let mut state = HostState::default();
        state.net_in_transfer = 500;
        state.net_out_transfer = 200;
        agent.record_state(state.clone(), Utc::now());

        let live = agent.live();
        assert_eq!(live.prev_transfer_in_snapshot, 500);
        assert_eq!(live.prev_transfer_out_snapshot, 200);

        state.net_in_transfer = 900;
        agent.record_state(state, Utc::now());
        // snapshots stay until the hourly point advances them
        assert_eq!(agent.live().prev_transfer_in_snapshot, 500);
        assert_eq!(agent.take_transfer_delta(), Some((400, 0)));
        assert_eq!(agent.take_transfer_delta(), None);
    }

    #[test]
    fn boot_time_jump_flushes_and_resets() {
        let agent = Agent::new(1, "aa".into(), meta("srv", 1));

        let mut host = Host::default();
        host.boot_time = 1000;
        assert_eq!(agent.record_host(host.clone()), None);

        // baseline point, then traffic accumulates on top of it
        let mut state = HostState::default();
        state.net_in_transfer = 1000;
        agent.record_state(state.clone(), Utc::now());
        state.net_in_transfer = 2000;
        agent.record_state(state, Utc::now());

        host.boot_time = 4600;
        assert_eq!(agent.record_host(host), Some((1000, 0)));

        let live = agent.live();
        assert_eq!(live.prev_transfer_in_snapshot, 0);
        assert_eq!(live.prev_transfer_out_snapshot, 0);
    }

    #[test]
    fn snapshots_reseed_after_reboot_reset() {
        let agent = Agent::new(1, "aa".into(), meta("srv", 1));

        let mut host = Host::default();
        host.boot_time = 1000;
        agent.record_host(host.clone());

        let mut state = HostState::default();
        state.net_in_transfer = 800;
        state.net_out_transfer = 300;
        agent.record_state(state, Utc::now());

        host.boot_time = 2000;
        agent.record_host(host);

        // counters restarted on the rebooted agent
        let mut state = HostState::default();
        state.net_in_transfer = 50;
        state.net_out_transfer = 10;
        agent.record_state(state, Utc::now());

        let live = agent.live();
        assert_eq!(live.prev_transfer_in_snapshot, 50);
        assert_eq!(live.prev_transfer_out_snapshot, 10);
    }
}
