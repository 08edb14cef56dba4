//! Per-job execution lock and bounded worker pool.
//!
//! Every run, scheduled or manual, goes through [`Dispatcher`]. A job id is
//! claimed before its task is spawned and released when the task ends, so
//! one job never has two runs in flight.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::Executor;
use crate::error::{Error, Result};
use crate::model::{Job, JobId, JobLog};
use crate::storage::{JobStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Scheduled,
    Manual,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
        }
    }
}

struct Inner {
    executor: Executor,
    jobs: JobStore,
    running: Mutex<HashSet<JobId>>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

/// Releases the job's claim when dropped, however the run ends.
struct RunClaim {
    inner: Arc<Inner>,
    job_id: JobId,
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        self.inner.running.lock().remove(&self.job_id);
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(executor: Executor, jobs: JobStore, max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                executor,
                jobs,
                running: Mutex::new(HashSet::new()),
                permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
                tracker: TaskTracker::new(),
            }),
        }
    }

    fn claim(&self, job_id: JobId) -> Option<RunClaim> {
        if !self.inner.running.lock().insert(job_id) {
            return None;
        }
        Some(RunClaim {
            inner: Arc::clone(&self.inner),
            job_id,
        })
    }

    pub fn is_running(&self, job_id: JobId) -> bool {
        self.inner.running.lock().contains(&job_id)
    }

    /// Jobs with a run in flight (including runs waiting for a permit).
    pub fn running_count(&self) -> usize {
        self.inner.running.lock().len()
    }

    /// Hand a due job to a worker. Never blocks; a job that is still running
    /// from its previous fire is skipped.
    pub fn dispatch_scheduled(&self, job_id: JobId, fired_at: DateTime<Utc>) {
        if self.inner.tracker.is_closed() {
            debug!(%job_id, "Dispatcher draining; scheduled fire dropped");
            return;
        }
        let Some(claim) = self.claim(job_id) else {
            warn!(%job_id, "Previous run still in progress; skipping scheduled fire");
            return;
        };

        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(async move {
            let _claim = claim;

            // The store is authoritative: the job may have been edited or
            // deleted since it was queued.
            let job = match inner.jobs.get(job_id) {
                Ok(Some(job)) if job.active => job,
                Ok(_) => {
                    debug!(%job_id, "Job gone or inactive at fire time; skipping");
                    return;
                }
                Err(e) => {
                    error!(%job_id, error = %e, "Failed to load job for scheduled fire");
                    return;
                }
            };
            if let Err(e) = inner.jobs.mark_fired(job_id, fired_at) {
                warn!(%job_id, error = %e, "Failed to record fire time");
            }

            if let Err(e) = run(&inner, &job, Trigger::Scheduled).await {
                error!(%job_id, error = %e, "Run could not be recorded");
            }
        });
    }

    /// Run `job` now and wait for its log. Fails with [`Error::Busy`] when a
    /// run of the same job is already in flight.
    pub async fn run_now(&self, job: Job) -> Result<JobLog> {
        if self.inner.tracker.is_closed() {
            return Err(Error::SchedulerStopped);
        }
        let claim = self.claim(job.id).ok_or(Error::Busy(job.id))?;

        // Spawned on the tracker so the run completes (and drains on shutdown)
        // even if the requesting client disconnects.
        let inner = Arc::clone(&self.inner);
        let handle = self.inner.tracker.spawn(async move {
            let _claim = claim;
            run(&inner, &job, Trigger::Manual).await
        });

        match handle.await {
            Ok(log) => Ok(log?),
            Err(e) => Err(Error::RunAborted(e.to_string())),
        }
    }

    /// Stop accepting runs and wait up to `grace` for in-flight ones.
    /// Returns whether everything finished in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.inner.tracker.close();
        let in_flight = self.inner.tracker.len();
        if in_flight > 0 {
            info!(in_flight, ?grace, "Waiting for in-flight runs");
        }
        match tokio::time::timeout(grace, self.inner.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(remaining = self.inner.tracker.len(), "Grace period elapsed; abandoning runs");
                false
            }
        }
    }
}

/// Wait for a worker permit, then execute.
async fn run(inner: &Inner, job: &Job, trigger: Trigger) -> std::result::Result<JobLog, StoreError> {
    let _permit = Arc::clone(&inner.permits).acquire_owned().await.ok();
    debug!(job_id = %job.id, trigger = trigger.as_str(), "Run started");
    inner.executor.execute(job).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, SharedClock, SystemClock};
    use crate::config::ExecutorConfig;
    use crate::executor::transport::{HttpRequest, HttpResponse, Transport, TransportError};
    use crate::executor::ExecutorSettings;
    use crate::model::{LogStatus, NewJob};
    use crate::storage::testing::temp_pool;
    use crate::storage::{LogRecorder, UserStore};
    use tokio::sync::Notify;

    /// Holds every request until released.
    struct Gate(Arc<Notify>);

    #[async_trait::async_trait]
    impl Transport for Gate {
        async fn send(&self, _req: &HttpRequest, _timeout: Duration) -> std::result::Result<HttpResponse, TransportError> {
            self.0.notified().await;
            Ok(HttpResponse {
                status: 200,
                status_text: "200 OK".into(),
                headers: Default::default(),
                body: Vec::new(),
                truncated: false,
            })
        }
    }

    fn setup(gate: Arc<Notify>) -> (Dispatcher, JobStore, Job, tempfile::TempDir) {
        let (pool, dir) = temp_pool();
        let clock: SharedClock = Arc::new(SystemClock);
        let owner = UserStore::new(pool.clone()).upsert("a@example.com", "A", clock.now()).unwrap();
        let jobs = JobStore::new(pool.clone());
        let req: NewJob = serde_json::from_value(serde_json::json!({
            "name": "gated", "schedule": "* * * * *", "endpoint": "http://localhost/", "method": "GET", "active": true
        }))
        .unwrap();
        let job = Job::create(owner.id, req, clock.now(), &ExecutorConfig::default()).unwrap();
        jobs.insert(&job).unwrap();

        let executor = Executor::new(
            Arc::new(Gate(gate)),
            LogRecorder::new(pool),
            clock,
            ExecutorSettings::from_config(&ExecutorConfig::default(), 5),
        );
        (Dispatcher::new(executor, jobs.clone(), 4), jobs, job, dir)
    }

    #[tokio::test]
    async fn test_manual_run_is_busy_while_scheduled_run_in_flight() {
        let gate = Arc::new(Notify::new());
        let (dispatcher, _jobs, job, _dir) = setup(Arc::clone(&gate));

        dispatcher.dispatch_scheduled(job.id, Utc::now());
        assert!(dispatcher.is_running(job.id));
        assert!(matches!(dispatcher.run_now(job.clone()).await, Err(Error::Busy(id)) if id == job.id));

        // A second scheduled fire is skipped rather than queued.
        dispatcher.dispatch_scheduled(job.id, Utc::now());
        assert_eq!(dispatcher.running_count(), 1);

        gate.notify_one();
        assert!(dispatcher.drain(Duration::from_secs(5)).await);
        assert!(!dispatcher.is_running(job.id));
    }

    #[tokio::test]
    async fn test_run_now_returns_finalized_log_and_releases_claim() {
        let gate = Arc::new(Notify::new());
        let (dispatcher, jobs, job, _dir) = setup(Arc::clone(&gate));
        gate.notify_one();

        let log = dispatcher.run_now(job.clone()).await.unwrap();
        assert_eq!(log.status, LogStatus::Success);
        assert_eq!(log.response_code, Some(200));
        assert!(!dispatcher.is_running(job.id));
        // Manual runs do not move the catch-up anchor.
        assert!(jobs.get(job.id).unwrap().unwrap().last_fired_at.is_none());
    }

    #[tokio::test]
    async fn test_closed_dispatcher_rejects_manual_runs() {
        let (dispatcher, _jobs, job, _dir) = setup(Arc::new(Notify::new()));
        assert!(dispatcher.drain(Duration::from_millis(10)).await);
        assert!(matches!(dispatcher.run_now(job).await, Err(Error::SchedulerStopped)));
    }
}
