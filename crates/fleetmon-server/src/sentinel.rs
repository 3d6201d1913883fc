use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;

use fleetmon_common::proto;
use fleetmon_common::types::{task_type, ProbeSample, ServiceStatus};
use fleetmon_notify::{mute_label, NotificationHub};
use fleetmon_storage::store::history::NewServiceHistory;
use fleetmon_storage::Store;

use crate::crontask::CronCoordinator;
use crate::error::Result;
use crate::model::Service;
use crate::registry::AgentRegistry;
use crate::scheduler::{job, JobId, Scheduler};

/// Size of the sliding window backing the "current" status.
pub const CURRENT_STATUS_SIZE: usize = 30;
/// The window accepts at most one sample per this many seconds.
const WINDOW_ADVANCE_SECS: i64 = 30;
/// Error sentinel emitted by agent-side TLS probes.
const TLS_ERROR_PREFIX: &str = "SSL证书错误：";
/// Certificates expiring within this many days trigger a warning.
const TLS_EXPIRY_WARN_DAYS: i64 = 7;

/// A probe result as received from the RPC layer.
#[derive(Debug)]
pub struct ReportData {
    pub result: proto::TaskResult,
    pub reporter: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct TodayStats {
    up: u64,
    down: u64,
    delay: f32,
}

#[derive(Debug, Clone)]
struct MonthlyStatus {
    delay: [f32; 30],
    up: [u64; 30],
    down: [u64; 30],
    total_up: u64,
    total_down: u64,
}

impl Default for MonthlyStatus {
    fn default() -> Self {
        Self {
            delay: [0.0; 30],
            up: [0; 30],
            down: [0; 30],
            total_up: 0,
            total_down: 0,
        }
    }
}

#[derive(Debug, Default)]
struct PingStore {
    count: u32,
    avg: f32,
}

/// What a single applied result asks the worker to do next, decided under
/// the state lock and acted on outside it.
#[derive(Debug)]
struct ApplyOutcome {
    state_code: ServiceStatus,
    prev_status: Option<ServiceStatus>,
    /// Run the state-change notification path.
    edge: bool,
    /// `(avg_delay, up, down)` of a filled window to persist.
    window_filled: Option<(f32, u64, u64)>,
}

/// All sliding-window state of one service.
#[derive(Debug, Default)]
struct ServiceState {
    today: TodayStats,
    window: Vec<ProbeSample>,
    window_gate: Option<DateTime<Utc>>,
    current_up: u64,
    current_down: u64,
    current_avg_delay: f32,
    monthly: MonthlyStatus,
    last_status: Option<ServiceStatus>,
    ping: HashMap<u64, PingStore>,
    tls_cert_cache: Option<String>,
}

impl ServiceState {
    fn apply_result(
        &mut self,
        successful: bool,
        delay: f32,
        data: &str,
        now: DateTime<Utc>,
    ) -> ApplyOutcome {
        if successful {
            self.today.delay =
                (self.today.delay * self.today.up as f32 + delay) / (self.today.up + 1) as f32;
            self.today.up += 1;
        } else {
            self.today.down += 1;
        }

        let gate = self.window_gate.get_or_insert(now);
        if now > *gate {
            *gate = now + Duration::seconds(WINDOW_ADVANCE_SECS);
            self.window.push(ProbeSample {
                successful,
                delay,
                data: data.to_owned(),
                recorded_at: now,
            });
        }

        self.current_up = 0;
        self.current_down = 0;
        self.current_avg_delay = 0.0;
        for sample in &self.window {
            if sample.successful {
                self.current_up += 1;
                self.current_avg_delay = (self.current_avg_delay
                    * (self.current_up - 1) as f32
                    + sample.delay)
                    / self.current_up as f32;
            } else {
                self.current_down += 1;
            }
        }

        let total = self.current_up + self.current_down;
        let percent = if total > 0 {
            self.current_up * 100 / total
        } else {
            0
        };
        let state_code = ServiceStatus::from_percent(percent);

        let window_filled = if self.window.len() >= CURRENT_STATUS_SIZE {
            self.window.clear();
            self.window_gate = Some(now);
            Some((self.current_avg_delay, self.current_up, self.current_down))
        } else {
            None
        };

        let prev_status = self.last_status;
        let edge = state_code == ServiceStatus::Down || prev_status != Some(state_code);
        if edge {
            self.last_status = Some(state_code);
        }

        ApplyOutcome {
            state_code,
            prev_status,
            edge,
            window_filled,
        }
    }

    /// Mirrors today's counters into the newest 30-day slot, keeping the
    /// totals consistent (`total == Σ slots`).
    fn refresh_today_slot(&mut self) {
        let m = &mut self.monthly;
        m.total_up = m.total_up.saturating_sub(m.up[29]) + self.today.up;
        m.total_down = m.total_down.saturating_sub(m.down[29]) + self.today.down;
        m.up[29] = self.today.up;
        m.down[29] = self.today.down;
        m.delay[29] = self.today.delay;
    }

    /// Daily rollover: drop the oldest slot, open a fresh one, reset today's
    /// counters and the sliding window.
    fn shift_day(&mut self) {
        let m = &mut self.monthly;
        m.total_up = m.total_up.saturating_sub(m.up[0]);
        m.total_down = m.total_down.saturating_sub(m.down[0]);
        for i in 0..29 {
            m.up[i] = m.up[i + 1];
            m.down[i] = m.down[i + 1];
            m.delay[i] = m.delay[i + 1];
        }
        m.up[29] = 0;
        m.down[29] = 0;
        m.delay[29] = 0.0;

        self.today = TodayStats::default();
        self.window.clear();
        self.window_gate = None;
        self.current_up = 0;
        self.current_down = 0;
        self.current_avg_delay = 0.0;
    }
}

/// 30-day availability view of one service, as served to the dashboard.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceStatsView {
    pub service_id: u64,
    pub service_name: String,
    pub current_up: u64,
    pub current_down: u64,
    pub delay: [f32; 30],
    pub up: [u64; 30],
    pub down: [u64; 30],
    pub total_up: u64,
    pub total_down: u64,
}

/// The probe-dispatch and result-aggregation engine. Owns every service
/// definition, its cron registration and all sliding-window state; consumes
/// probe results from a buffered ingest channel.
pub struct ServiceSentinel {
    services: RwLock<HashMap<u64, Arc<Service>>>,
    service_list: RwLock<Vec<Arc<Service>>>,
    // lock order: `states` before `services` is never required; neither lock
    // is held across an await
    states: Mutex<HashMap<u64, ServiceState>>,
    probe_jobs: Mutex<HashMap<u64, JobId>>,
    report_tx: mpsc::Sender<ReportData>,
    dispatch_tx: mpsc::Sender<Arc<Service>>,
    avg_ping_count: u32,

    store: Store,
    registry: Arc<AgentRegistry>,
    hub: Arc<NotificationHub>,
    crontask: Arc<CronCoordinator>,
    scheduler: Arc<Scheduler>,
}

impl ServiceSentinel {
    /// Builds the sentinel: loads service definitions and their persisted
    /// history, registers the probe cron jobs and the daily rollover, and
    /// starts the ingest worker. `dispatch_tx` is the bus drained by the RPC
    /// fan-out.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        store: Store,
        registry: Arc<AgentRegistry>,
        hub: Arc<NotificationHub>,
        crontask: Arc<CronCoordinator>,
        scheduler: Arc<Scheduler>,
        dispatch_tx: mpsc::Sender<Arc<Service>>,
        avg_ping_count: u32,
    ) -> Result<Arc<Self>> {
        let (report_tx, report_rx) = mpsc::channel(200);
        let sentinel = Arc::new(Self {
            services: RwLock::new(HashMap::new()),
            service_list: RwLock::new(Vec::new()),
            states: Mutex::new(HashMap::new()),
            probe_jobs: Mutex::new(HashMap::new()),
            report_tx,
            dispatch_tx,
            avg_ping_count,
            store,
            registry,
            hub,
            crontask,
            scheduler,
        });

        for model in sentinel.store.list_services().await? {
            let service = Arc::new(Service::from_model(model));
            sentinel.states
                .lock()
                .unwrap()
                .insert(service.id, ServiceState::default());
            let job_id = sentinel.register_probe(&service)?;
            sentinel.probe_jobs.lock().unwrap().insert(service.id, job_id);
            sentinel.services
                .write()
                .unwrap()
                .insert(service.id, service);
        }
        sentinel.rebuild_sorted();
        sentinel.load_history().await?;

        {
            let weak = Arc::downgrade(&sentinel);
            sentinel.scheduler.add_cron(
                "0 0 0 * * *",
                job(move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(s) = weak.upgrade() {
                            s.rollover_day();
                        }
                    }
                }),
            )?;
        }

        let worker = sentinel.clone();
        tokio::spawn(async move {
            worker.worker(report_rx).await;
        });

        Ok(sentinel)
    }

    /// Hands a probe result to the worker; blocks when the ingest buffer is
    /// full, which is the intended backpressure on the RPC layer.
    pub async fn dispatch(&self, report: ReportData) {
        let _ = self.report_tx.send(report).await;
    }

    pub fn get(&self, id: u64) -> Option<Arc<Service>> {
        self.services.read().unwrap().get(&id).cloned()
    }

    pub fn list(&self) -> HashMap<u64, Arc<Service>> {
        self.services.read().unwrap().clone()
    }

    pub fn sorted_list(&self) -> Vec<Arc<Service>> {
        self.service_list.read().unwrap().clone()
    }

    pub fn service_ids(&self) -> Vec<u64> {
        self.services.read().unwrap().keys().copied().collect()
    }

    /// Registers or replaces a service, re-registering its probe job.
    pub fn update_service(&self, service: Service) -> Result<()> {
        let service = Arc::new(service);
        let new_job = self.register_probe(&service)?;

        let old_job = self.probe_jobs.lock().unwrap().insert(service.id, new_job);
        if let Some(old) = old_job {
            self.scheduler.remove(old);
        }
        self.states
            .lock()
            .unwrap()
            .entry(service.id)
            .or_default();
        self.services
            .write()
            .unwrap()
            .insert(service.id, service);
        self.rebuild_sorted();
        Ok(())
    }

    /// Removes services together with all their live state and cron
    /// registrations.
    pub fn delete_services(&self, ids: &[u64]) {
        {
            let mut states = self.states.lock().unwrap();
            let mut jobs = self.probe_jobs.lock().unwrap();
            let mut services = self.services.write().unwrap();
            for id in ids {
                states.remove(id);
                services.remove(id);
                if let Some(job_id) = jobs.remove(id) {
                    self.scheduler.remove(job_id);
                }
            }
        }
        self.rebuild_sorted();
    }

    /// The 30-day availability of every service shown on the status page.
    pub fn stats(&self) -> Vec<ServiceStatsView> {
        let services = self.sorted_list();
        let mut states = self.states.lock().unwrap();
        services
            .iter()
            .filter(|s| s.enable_show_in_service)
            .filter_map(|s| {
                let st = states.get_mut(&s.id)?;
                st.refresh_today_slot();
                Some(ServiceStatsView {
                    service_id: s.id,
                    service_name: s.name.clone(),
                    current_up: st.current_up,
                    current_down: st.current_down,
                    delay: st.monthly.delay,
                    up: st.monthly.up,
                    down: st.monthly.down,
                    total_up: st.monthly.total_up,
                    total_down: st.monthly.total_down,
                })
            })
            .collect()
    }

    fn rebuild_sorted(&self) {
        let mut list: Vec<Arc<Service>> =
            self.services.read().unwrap().values().cloned().collect();
        list.sort_by_key(|s| s.id);
        *self.service_list.write().unwrap() = list;
    }

    /// Registers the cron job whose body pushes the probe descriptor onto
    /// the dispatch bus.
    fn register_probe(&self, service: &Arc<Service>) -> Result<JobId> {
        let spec = service.cron_spec.clone();
        let interval = std::time::Duration::from_secs(service.duration.max(10));
        let tx = self.dispatch_tx.clone();
        let service = service.clone();
        let body = job(move || {
            let tx = tx.clone();
            let service = service.clone();
            async move {
                let _ = tx.send(service).await;
            }
        });
        if spec.is_empty() {
            Ok(self.scheduler.add_every(interval, body))
        } else {
            self.scheduler.add_cron(&spec, body)
        }
    }

    fn rollover_day(&self) {
        let mut states = self.states.lock().unwrap();
        for state in states.values_mut() {
            state.refresh_today_slot();
            state.shift_day();
        }
        tracing::info!("service status rolled over to a new day");
    }

    /// Seeds today's counters and the 30-day slots from persisted aggregate
    /// rows.
    async fn load_history(&self) -> Result<()> {
        let tz = self.scheduler.timezone();
        let today_start = Utc::now()
            .with_timezone(&tz)
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .and_then(|t| t.and_local_timezone(tz).single())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let today_rows = self.store.list_aggregate_histories_since(today_start).await?;
        let month_rows = self
            .store
            .list_aggregate_histories_between(today_start - Duration::days(29), today_start)
            .await?;

        let mut states = self.states.lock().unwrap();
        let mut delay_samples: HashMap<u64, f32> = HashMap::new();
        for row in &today_rows {
            let Some(st) = states.get_mut(&(row.service_id as u64)) else {
                continue;
            };
            st.today.up += row.up.max(0) as u64;
            st.today.down += row.down.max(0) as u64;
            st.monthly.total_up += row.up.max(0) as u64;
            st.monthly.total_down += row.down.max(0) as u64;
            let count = delay_samples.entry(row.service_id as u64).or_insert(0.0);
            st.today.delay = (st.today.delay * *count + row.avg_delay) / (*count + 1.0);
            *count += 1.0;
        }

        let mut day_delay_count: HashMap<(u64, usize), f32> = HashMap::new();
        for row in &month_rows {
            let service_id = row.service_id as u64;
            let Some(st) = states.get_mut(&service_id) else {
                continue;
            };
            let days_ago = (today_start - row.created_at).num_hours() / 24;
            let Some(index) = 28usize.checked_sub(days_ago as usize) else {
                continue;
            };
            let count = day_delay_count.entry((service_id, index)).or_insert(0.0);
            st.monthly.delay[index] =
                (st.monthly.delay[index] * *count + row.avg_delay) / (*count + 1.0);
            *count += 1.0;
            st.monthly.up[index] += row.up.max(0) as u64;
            st.monthly.down[index] += row.down.max(0) as u64;
            st.monthly.total_up += row.up.max(0) as u64;
            st.monthly.total_down += row.down.max(0) as u64;
        }
        Ok(())
    }

    async fn worker(self: Arc<Self>, mut rx: mpsc::Receiver<ReportData>) {
        while let Some(report) = rx.recv().await {
            self.handle_report(report).await;
        }
    }

    async fn handle_report(&self, report: ReportData) {
        let result = &report.result;
        let Some(service) = self.get(result.id) else {
            tracing::warn!(service_id = result.id, reporter = report.reporter,
                "probe report for unknown service");
            return;
        };

        // per-reporter running mean for tcp/icmp probes
        if matches!(result.r#type, task_type::TCP_PING | task_type::ICMP_PING) {
            let row = {
                let mut states = self.states.lock().unwrap();
                states.get_mut(&service.id).and_then(|st| {
                    let ps = st.ping.entry(report.reporter).or_default();
                    ps.count += 1;
                    ps.avg = (ps.avg * (ps.count - 1) as f32 + result.delay) / ps.count as f32;
                    if ps.count >= self.avg_ping_count {
                        ps.count = 0;
                        Some(NewServiceHistory {
                            service_id: service.id,
                            server_id: report.reporter,
                            avg_delay: ps.avg,
                            up: 0,
                            down: 0,
                            data: result.data.clone(),
                        })
                    } else {
                        None
                    }
                })
            };
            if let Some(row) = row {
                if let Err(e) = self.store.create_service_history(row).await {
                    tracing::error!(error = %e, "failed to save probe metrics");
                }
            }
        }

        let now = Utc::now();
        let outcome = {
            let mut states = self.states.lock().unwrap();
            let st = states.entry(service.id).or_default();
            st.apply_result(result.successful, result.delay, &result.data, now)
        };

        if let Some((avg_delay, up, down)) = outcome.window_filled {
            let row = NewServiceHistory {
                service_id: service.id,
                server_id: 0,
                avg_delay,
                up,
                down,
                data: result.data.clone(),
            };
            if let Err(e) = self.store.create_service_history(row).await {
                tracing::error!(error = %e, "failed to save service status");
            }
        }

        if result.delay > 0.0 {
            self.check_latency(&service, &report);
        }
        if outcome.edge {
            self.check_state_change(&service, &report, outcome.prev_status, outcome.state_code);
        }
        self.check_tls(&service, result);
    }

    fn reporter_name(&self, reporter: u64) -> String {
        self.registry
            .get(reporter)
            .map(|a| a.meta().name)
            .unwrap_or_else(|| format!("#{reporter}"))
    }

    fn check_latency(&self, service: &Arc<Service>, report: &ReportData) {
        if !service.latency_notify {
            return;
        }
        let delay = report.result.delay;
        let min_label = mute_label::service_latency_min(service.id);
        let max_label = mute_label::service_latency_max(service.id);
        let group_id = service.notification_group_id;

        if delay > service.max_latency {
            let msg = format!(
                "[Latency] {} {:.2} > {:.2}, Reporter: {}",
                service.name,
                delay,
                service.max_latency,
                self.reporter_name(report.reporter)
            );
            let hub = self.hub.clone();
            tokio::spawn(async move {
                hub.send_notification(group_id, &msg, Some(&min_label), None).await;
            });
        } else if delay < service.min_latency {
            let msg = format!(
                "[Latency] {} {:.2} < {:.2}, Reporter: {}",
                service.name,
                delay,
                service.min_latency,
                self.reporter_name(report.reporter)
            );
            let hub = self.hub.clone();
            tokio::spawn(async move {
                hub.send_notification(group_id, &msg, Some(&max_label), None).await;
            });
        } else {
            self.hub.unmute_notification(group_id, &min_label);
            self.hub.unmute_notification(group_id, &max_label);
        }
    }

    fn check_state_change(
        &self,
        service: &Arc<Service>,
        report: &ReportData,
        prev: Option<ServiceStatus>,
        current: ServiceStatus,
    ) {
        let need_notify = service.notify && (prev.is_some() || current == ServiceStatus::Down);
        if need_notify {
            let label = mute_label::service_state_changed(service.id);
            if prev != Some(current) {
                self.hub
                    .unmute_notification(service.notification_group_id, &label);
            }
            let msg = format!(
                "[{current}] {} Reporter: {}, Error: {}",
                service.name,
                self.reporter_name(report.reporter),
                report.result.data
            );
            let hub = self.hub.clone();
            let group_id = service.notification_group_id;
            tokio::spawn(async move {
                hub.send_notification(group_id, &msg, Some(&label), None).await;
            });
        }

        if service.enable_trigger_task && prev.is_some() {
            let changed = prev != Some(current);
            if current == ServiceStatus::Good && changed {
                self.crontask
                    .send_trigger_tasks(&service.recover_trigger_tasks, report.reporter);
            } else if prev == Some(ServiceStatus::Good) && changed {
                self.crontask
                    .send_trigger_tasks(&service.fail_trigger_tasks, report.reporter);
            }
        }
    }

    fn check_tls(&self, service: &Arc<Service>, result: &proto::TaskResult) {
        let data = result.data.as_str();
        if data.is_empty() {
            return;
        }

        if let Some(err) = data.strip_prefix(TLS_ERROR_PREFIX) {
            let transient = data.ends_with("timeout")
                || data.ends_with("EOF")
                || data.ends_with("timed out");
            if !transient && service.notify {
                let label = mute_label::service_tls(service.id, "network");
                let msg = format!(
                    "[TLS] Fetch cert info failed, Reporter: {}, Error: {}",
                    service.name, err
                );
                let hub = self.hub.clone();
                let group_id = service.notification_group_id;
                tokio::spawn(async move {
                    hub.send_notification(group_id, &msg, Some(&label), None).await;
                });
            }
            return;
        }

        let Some((issuer, expiry_raw)) = data.split_once('|') else {
            return;
        };
        // reachable again: clear the network-error mute
        self.hub.unmute_notification(
            service.notification_group_id,
            &mute_label::service_tls(service.id, "network"),
        );

        let Some(new_expiry) = parse_cert_expiry(expiry_raw) else {
            return;
        };

        let old_cert = {
            let mut states = self.states.lock().unwrap();
            let Some(st) = states.get_mut(&service.id) else {
                return;
            };
            let old = st
                .tls_cert_cache
                .get_or_insert_with(|| data.to_owned())
                .clone();
            old
        };

        let (old_issuer, old_expiry_raw) = old_cert.split_once('|').unwrap_or((issuer, expiry_raw));
        let old_expiry = parse_cert_expiry(old_expiry_raw);
        let cert_changed =
            old_issuer != issuer && old_expiry.is_some_and(|old| old != new_expiry);
        if cert_changed {
            let mut states = self.states.lock().unwrap();
            if let Some(st) = states.get_mut(&service.id) {
                st.tls_cert_cache = Some(data.to_owned());
            }
        }

        if !service.notify {
            return;
        }
        let group_id = service.notification_group_id;

        if new_expiry < Utc::now() + Duration::days(TLS_EXPIRY_WARN_DAYS) {
            let expiry_str = new_expiry.format("%Y-%m-%d %H:%M:%S").to_string();
            // keyed by expiry so multiple reporters of one cert share a mute
            let label = mute_label::service_tls(service.id, &format!("expire_{expiry_str}"));
            let msg = format!(
                "[TLS] {} The certificate will expire within seven days. Expiration time: {}",
                service.name, expiry_str
            );
            let hub = self.hub.clone();
            tokio::spawn(async move {
                hub.send_notification(group_id, &msg, Some(&label), None).await;
            });
        }

        if cert_changed {
            let msg = format!(
                "[TLS] {} Certificate changed, old: issuer {}, expires at {}; new: issuer {}, expires at {}",
                service.name,
                old_issuer,
                old_expiry.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()).unwrap_or_default(),
                issuer,
                new_expiry.format("%Y-%m-%d %H:%M:%S")
            );
            let hub = self.hub.clone();
            tokio::spawn(async move {
                // the cache already moved on, no mute needed
                hub.send_notification(group_id, &msg, None, None).await;
            });
        }
    }
}

/// Parses the expiry half of an `issuer|expiry` pair: RFC 3339, or the
/// zone-name-suffixed layout some probes emit
/// (`2006-01-02 15:04:05 -0700 MST`).
fn parse_cert_expiry(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    let fields: Vec<&str> = raw.split_whitespace().collect();
    if fields.len() >= 3 {
        let candidate = format!("{} {} {}", fields[0], fields[1], fields[2]);
        if let Ok(t) = DateTime::parse_from_str(&candidate, "%Y-%m-%d %H:%M:%S %z") {
            return Some(t.with_timezone(&Utc));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_gate_limits_sample_rate() {
        let mut st = ServiceState::default();
        let t0 = Utc::now();

        // first sample establishes the gate without entering the window
        let outcome = st.apply_result(true, 10.0, "", t0);
        assert_eq!(st.window.len(), 0);
        assert_eq!(st.today.up, 1);
        assert_eq!(outcome.state_code, ServiceStatus::NoData);

        // a burst within the same instant is gated out of the window
        st.apply_result(true, 10.0, "", t0);
        assert_eq!(st.window.len(), 0);
        assert_eq!(st.today.up, 2);

        // later samples are admitted, one per 30 s step
        let outcome = st.apply_result(true, 20.0, "", t0 + Duration::seconds(1));
        assert_eq!(st.window.len(), 1);
        assert_eq!(outcome.state_code, ServiceStatus::Good);

        st.apply_result(false, 0.0, "", t0 + Duration::seconds(5));
        assert_eq!(st.window.len(), 1, "gate must hold for 30s");
        st.apply_result(false, 0.0, "", t0 + Duration::seconds(40));
        assert_eq!(st.window.len(), 2);
        assert_eq!(st.current_down, 1);
    }

    #[test]
    fn today_average_is_incremental() {
        let mut st = ServiceState::default();
        let t0 = Utc::now();
        st.apply_result(true, 10.0, "", t0);
        st.apply_result(true, 20.0, "", t0 + Duration::seconds(31));
        st.apply_result(true, 30.0, "", t0 + Duration::seconds(62));
        assert_eq!(st.today.up, 3);
        assert!((st.today.delay - 20.0).abs() < 0.01);

        st.apply_result(false, 0.0, "", t0 + Duration::seconds(93));
        assert_eq!(st.today.down, 1);
        assert!((st.today.delay - 20.0).abs() < 0.01, "failures keep the average");
    }

    #[test]
    fn filled_window_produces_aggregate_and_truncates() {
        let mut st = ServiceState::default();
        let mut t = Utc::now();
        st.apply_result(true, 5.0, "", t);

        let mut filled = None;
        for i in 0..CURRENT_STATUS_SIZE {
            t += Duration::seconds(31);
            let successful = i % 10 != 0; // 3 failures out of 30
            let outcome = st.apply_result(successful, 5.0, "", t);
            if outcome.window_filled.is_some() {
                filled = outcome.window_filled;
            }
        }

        let (avg, up, down) = filled.expect("window should have filled");
        assert_eq!(up + down, CURRENT_STATUS_SIZE as u64);
        assert_eq!(down, 3);
        assert!((avg - 5.0).abs() < 0.01);
        assert_eq!(st.window.len(), 0);
    }

    #[test]
    fn status_edges_and_last_status() {
        let mut st = ServiceState::default();
        let mut t = Utc::now();

        st.apply_result(true, 5.0, "", t);
        t += Duration::seconds(31);
        let outcome = st.apply_result(true, 5.0, "", t);
        assert_eq!(outcome.state_code, ServiceStatus::Good);
        assert!(outcome.edge, "first status is an edge");
        assert_eq!(outcome.prev_status, None);

        t += Duration::seconds(31);
        let outcome = st.apply_result(true, 5.0, "", t);
        assert_eq!(outcome.state_code, ServiceStatus::Good);
        assert!(!outcome.edge, "steady good state is not an edge");

        // fail until availability drops to Down
        let mut last = None;
        for _ in 0..8 {
            t += Duration::seconds(31);
            last = Some(st.apply_result(false, 0.0, "", t));
        }
        let outcome = last.unwrap();
        assert_eq!(outcome.state_code, ServiceStatus::Down);
        // Down keeps flagging even without a transition
        assert!(outcome.edge);
        assert_eq!(st.last_status, Some(ServiceStatus::Down));
    }

    #[test]
    fn totals_match_slot_sums_through_rollover() {
        let mut st = ServiceState::default();
        st.today.up = 40;
        st.today.down = 2;
        st.today.delay = 12.0;
        st.monthly.up[0] = 7;
        st.monthly.down[0] = 1;
        st.monthly.total_up = 7;
        st.monthly.total_down = 1;

        st.refresh_today_slot();
        assert_eq!(st.monthly.total_up, 47);
        assert_eq!(st.monthly.total_down, 3);
        assert_eq!(st.monthly.up[29], 40);

        st.shift_day();
        // the oldest day (7 up / 1 down) fell out of the 30-day horizon
        assert_eq!(st.monthly.total_up, 40);
        assert_eq!(st.monthly.total_down, 2);
        assert_eq!(st.monthly.up[28], 40);
        assert_eq!(st.monthly.up[29], 0);
        assert_eq!(st.today.up, 0);
        assert!(st.window.is_empty());

        let slot_sum: u64 = st.monthly.up.iter().sum::<u64>() + st.monthly.down.iter().sum::<u64>();
        assert_eq!(
            slot_sum,
            st.monthly.total_up + st.monthly.total_down,
            "totals must equal the slot sums"
        );
    }

    #[test]
    fn cert_expiry_parsing() {
        assert!(parse_cert_expiry("2026-03-01T00:00:00Z").is_some());
        let t = parse_cert_expiry("2026-03-01 12:30:00 +0000 UTC").unwrap();
        assert_eq!(t.format("%H:%M").to_string(), "12:30");
        assert!(parse_cert_expiry("garbage").is_none());
    }
}
