use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use chrono_tz::Tz;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;

use crate::error::{Result, ServerError};

/// Handle to a registered job; removing it aborts the driving task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

pub type JobFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure into the boxed shape jobs are stored as.
pub fn job<F, Fut>(f: F) -> JobFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// Seconds-precision cron scheduler running in the dashboard's timezone.
/// Each job is a spawned task that sleeps to its next occurrence; callback
/// bodies must assume they run concurrently with the API.
pub struct Scheduler {
    tz: Tz,
    jobs: Mutex<HashMap<JobId, JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl Scheduler {
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Registers a job under a six-field (seconds-precision) cron spec.
    pub fn add_cron(&self, spec: &str, f: JobFn) -> Result<JobId> {
        let schedule =
            cron::Schedule::from_str(spec).map_err(|e| ServerError::InvalidCron {
                spec: spec.to_owned(),
                reason: e.to_string(),
            })?;
        let tz = self.tz;
        let handle = tokio::spawn(async move {
            loop {
                let now = Utc::now().with_timezone(&tz);
                let Some(next) = schedule.after(&now).next() else {
                    break;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
                f().await;
            }
        });
        Ok(self.track(handle))
    }

    /// Registers a fixed-interval job; the first run happens one period from
    /// now.
    pub fn add_every(&self, period: std::time::Duration, f: JobFn) -> JobId {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                f().await;
            }
        });
        self.track(handle)
    }

    pub fn remove(&self, id: JobId) {
        if let Some(handle) = self.jobs.lock().unwrap().remove(&id) {
            handle.abort();
        }
    }

    fn track(&self, handle: JoinHandle<()>) -> JobId {
        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.jobs.lock().unwrap().insert(id, handle);
        id
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for (_, handle) in self.jobs.lock().unwrap().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn scheduler() -> Scheduler {
        Scheduler::new(chrono_tz::Asia::Shanghai)
    }

    #[tokio::test]
    async fn rejects_invalid_spec() {
        let s = scheduler();
        let result = s.add_cron("not a cron", job(|| async {}));
        assert!(matches!(result, Err(ServerError::InvalidCron { .. })));
    }

    #[tokio::test]
    async fn accepts_seconds_precision_specs() {
        let s = scheduler();
        for spec in ["0 30 3 * * *", "0 0 0 * * *", "0 0 * * * *", "*/30 * * * * *"] {
            s.add_cron(spec, job(|| async {})).unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn interval_job_fires_and_stops_on_remove() {
        let s = scheduler();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = s.add_every(std::time::Duration::from_secs(20), job(move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        }));

        tokio::time::sleep(std::time::Duration::from_secs(65)).await;
        let fired = count.load(Ordering::SeqCst);
        assert!((2..=4).contains(&fired), "fired {fired} times");

        s.remove(id);
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        assert!(count.load(Ordering::SeqCst) <= fired + 1);
    }
}
