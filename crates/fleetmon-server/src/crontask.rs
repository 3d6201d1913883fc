use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, RwLock};

use fleetmon_notify::NotificationHub;
use fleetmon_storage::Store;

use crate::model::{Cron, CronCover, CronType};
use crate::registry::AgentRegistry;
use crate::scheduler::{job, JobId, Scheduler};

/// Owns user-defined tasks: registers the scheduled ones as cron jobs and
/// fans commands out over agent task streams.
pub struct CronCoordinator {
    list: RwLock<HashMap<u64, Arc<Cron>>>,
    sorted: RwLock<Vec<Arc<Cron>>>,
    job_ids: RwLock<HashMap<u64, JobId>>,
    scheduler: Arc<Scheduler>,
    registry: Arc<AgentRegistry>,
    hub: Arc<NotificationHub>,
}

impl CronCoordinator {
    /// Loads all tasks and registers the scheduled ones. Registration
    /// failures are collated per notification group and reported once.
    pub async fn load(
        store: &Store,
        scheduler: Arc<Scheduler>,
        registry: Arc<AgentRegistry>,
        hub: Arc<NotificationHub>,
    ) -> crate::error::Result<Arc<Self>> {
        let coordinator = Arc::new(Self {
            list: RwLock::new(HashMap::new()),
            sorted: RwLock::new(Vec::new()),
            job_ids: RwLock::new(HashMap::new()),
            scheduler,
            registry,
            hub,
        });

        let mut failed_by_group: HashMap<u64, String> = HashMap::new();
        for model in store.list_crons().await? {
            let task = Arc::new(Cron::from_model(model));
            if task.task_type == CronType::Scheduled {
                match coordinator.register_job(&task) {
                    Ok(id) => {
                        coordinator.job_ids.write().unwrap().insert(task.id, id);
                    }
                    Err(e) => {
                        tracing::warn!(task_id = task.id, error = %e, "task failed to register");
                        let msg = failed_by_group
                            .entry(task.notification_group_id)
                            .or_insert_with(|| "Tasks failed to register: [".to_string());
                        let _ = write!(msg, "{},", task.id);
                        continue;
                    }
                }
            }
            coordinator.list.write().unwrap().insert(task.id, task);
        }
        coordinator.rebuild_sorted();

        for (group_id, mut msg) in failed_by_group {
            msg.push_str("] These tasks will not execute properly. Fix them in the dashboard.");
            let hub = coordinator.hub.clone();
            tokio::spawn(async move {
                hub.send_notification(group_id, &msg, None, None).await;
            });
        }

        Ok(coordinator)
    }

    fn register_job(self: &Arc<Self>, task: &Arc<Cron>) -> crate::error::Result<JobId> {
        let coordinator = Arc::downgrade(self);
        let spec = task.scheduler.clone();
        let task = task.clone();
        self.scheduler.add_cron(
            &spec,
            job(move || {
                let coordinator = coordinator.clone();
                let task = task.clone();
                async move {
                    if let Some(c) = coordinator.upgrade() {
                        c.run_task(&task, None).await;
                    }
                }
            }),
        )
    }

    pub fn get(&self, id: u64) -> Option<Arc<Cron>> {
        self.list.read().unwrap().get(&id).cloned()
    }

    pub fn sorted_list(&self) -> Vec<Arc<Cron>> {
        self.sorted.read().unwrap().clone()
    }

    /// Replaces a task, re-registering its cron job when scheduled.
    pub fn update(self: &Arc<Self>, task: Cron) -> crate::error::Result<()> {
        let task = Arc::new(task);
        if let Some(old_id) = self.job_ids.write().unwrap().remove(&task.id) {
            self.scheduler.remove(old_id);
        }
        if task.task_type == CronType::Scheduled {
            let id = self.register_job(&task)?;
            self.job_ids.write().unwrap().insert(task.id, id);
        }
        self.list.write().unwrap().insert(task.id, task);
        self.rebuild_sorted();
        Ok(())
    }

    pub fn delete(&self, ids: &[u64]) {
        {
            let mut list = self.list.write().unwrap();
            let mut jobs = self.job_ids.write().unwrap();
            for id in ids {
                list.remove(id);
                if let Some(job_id) = jobs.remove(id) {
                    self.scheduler.remove(job_id);
                }
            }
        }
        self.rebuild_sorted();
    }

    fn rebuild_sorted(&self) {
        let mut tasks: Vec<Arc<Cron>> = self.list.read().unwrap().values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        *self.sorted.write().unwrap() = tasks;
    }

    /// Fires the given trigger tasks on behalf of an alert or service
    /// transition; each runs in its own task.
    pub fn send_trigger_tasks(self: &Arc<Self>, task_ids: &[u64], triggering_server: u64) {
        let tasks: Vec<Arc<Cron>> = {
            let list = self.list.read().unwrap();
            task_ids.iter().filter_map(|id| list.get(id).cloned()).collect()
        };
        for task in tasks {
            let coordinator = self.clone();
            tokio::spawn(async move {
                coordinator.run_task(&task, Some(triggering_server)).await;
            });
        }
    }

    /// Manual "run now" from the dashboard.
    pub async fn manual_trigger(self: &Arc<Self>, id: u64) -> crate::error::Result<()> {
        let task = self
            .get(id)
            .ok_or(crate::error::ServerError::NotFound { entity: "cron", id })?;
        self.run_task(&task, None).await;
        Ok(())
    }

    /// Sends the command to every agent the task covers. Agents without a
    /// live task stream produce an offline notification instead.
    async fn run_task(&self, task: &Cron, triggering_server: Option<u64>) {
        if task.cover == CronCover::AlertTrigger {
            let Some(server_id) = triggering_server else {
                return;
            };
            let Some(agent) = self.registry.get(server_id) else {
                return;
            };
            if !agent.send_task(task.to_task()) {
                self.notify_offline(task, &agent).await;
            }
            return;
        }

        let listed: std::collections::HashSet<u64> = task.servers.iter().copied().collect();
        let agents = self.registry.list();
        for (id, agent) in agents {
            let skip = match task.cover {
                CronCover::All => listed.contains(&id),
                CronCover::OnlyListed => !listed.contains(&id),
                CronCover::AlertTrigger => unreachable!(),
            };
            if skip {
                continue;
            }
            if !agent.send_task(task.to_task()) {
                self.notify_offline(task, &agent).await;
            }
        }
    }

    async fn notify_offline(&self, task: &Cron, agent: &crate::registry::Agent) {
        let message = format!(
            "[Task failed] {}: server {} is offline and cannot execute the task",
            task.name,
            agent.meta().name
        );
        let context = agent.notification_context();
        self.hub
            .send_notification(task.notification_group_id, &message, None, Some(&context))
            .await;
    }
}
