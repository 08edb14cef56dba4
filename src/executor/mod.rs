//! Job execution: one HTTP call per attempt, bounded by a timeout, retried
//! with capped exponential backoff, summarized into a single [`JobLog`].

pub mod dispatch;
pub mod probe;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use self::transport::{HttpRequest, HttpResponse, Transport, TransportError};
use crate::clock::SharedClock;
use crate::config::ExecutorConfig;
use crate::model::{Job, JobLog, LogStatus};
use crate::storage::{LogRecorder, StoreError};

pub use self::dispatch::{Dispatcher, Trigger};

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`,
    /// capped, plus up to 10% jitter. Never exceeds `cap`.
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        let raw = self.base.saturating_mul(1u32 << exp).min(self.cap);
        let jitter_ms = (raw.as_millis() / 10) as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (raw + jitter).min(self.cap)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub backoff: Backoff,
    /// Response bytes kept in the log.
    pub snapshot_bytes: usize,
    /// Per-job log cap enforced after every run.
    pub max_logs_per_job: Option<usize>,
}

impl ExecutorSettings {
    pub fn from_config(executor: &ExecutorConfig, max_logs_per_job: usize) -> Self {
        Self {
            default_timeout: executor.default_timeout(),
            max_timeout: Duration::from_secs(executor.max_timeout_secs),
            backoff: Backoff {
                base: Duration::from_millis(executor.backoff_base_ms),
                cap: Duration::from_millis(executor.backoff_max_ms),
            },
            snapshot_bytes: executor.response_snapshot_bytes,
            max_logs_per_job: (max_logs_per_job > 0).then_some(max_logs_per_job),
        }
    }

    fn timeout_for(&self, job: &Job) -> Duration {
        job.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
            .min(self.max_timeout)
    }
}

/// Final result of all attempts of one run.
struct Outcome {
    status: LogStatus,
    attempts: u32,
    response_code: Option<u16>,
    error: Option<String>,
    body: Option<String>,
}

impl Outcome {
    fn from_attempt(result: Result<HttpResponse, TransportError>, attempts: u32) -> Self {
        match result {
            Ok(resp) => {
                let body = (!resp.body.is_empty()).then(|| resp.body_text());
                let (status, error) = if resp.is_success() {
                    (LogStatus::Success, None)
                } else {
                    (
                        LogStatus::Failure,
                        Some(format!("endpoint returned error status {}", resp.status_text)),
                    )
                };
                Self {
                    status,
                    attempts,
                    response_code: Some(resp.status),
                    error,
                    body,
                }
            }
            Err(e) => Self {
                status: LogStatus::Failure,
                attempts,
                response_code: None,
                error: Some(e.to_string()),
                body: None,
            },
        }
    }
}

/// Runs jobs and records their logs.
#[derive(Clone)]
pub struct Executor {
    transport: Arc<dyn Transport>,
    recorder: LogRecorder,
    clock: SharedClock,
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(
        transport: Arc<dyn Transport>,
        recorder: LogRecorder,
        clock: SharedClock,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            transport,
            recorder,
            clock,
            settings,
        }
    }

    /// Run `job` once (with retries) and return its finalized log.
    ///
    /// Execution failures are data in the returned log; only storage
    /// failures surface as errors.
    pub async fn execute(&self, job: &Job) -> Result<JobLog, StoreError> {
        let mut log = JobLog::started(job.id, self.clock.now());
        self.recorder.begin(&log)?;

        let outcome = self.attempt_all(job).await;

        log.attempts = outcome.attempts;
        log.response_code = outcome.response_code;
        log.error = outcome.error;
        log.response_body = outcome.body;
        log.finish(self.clock.now(), outcome.status);

        if !self.recorder.finalize(&log)? {
            warn!(job_id = %job.id, log_id = %log.id, "Run finished after its job was deleted; log discarded");
            return Ok(log);
        }

        if let Some(cap) = self.settings.max_logs_per_job {
            if let Err(e) = self.recorder.trim_job(job.id, cap) {
                warn!(job_id = %job.id, error = %e, "Failed to trim old logs");
            }
        }

        info!(
            job_id = %job.id,
            status = log.status.as_str(),
            attempts = log.attempts,
            response_code = ?log.response_code,
            duration_ms = ?log.duration_ms,
            "Run finished"
        );
        Ok(log)
    }

    async fn attempt_all(&self, job: &Job) -> Outcome {
        let timeout = self.settings.timeout_for(job);
        let request = HttpRequest::for_job(job, self.settings.snapshot_bytes);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(timeout, self.transport.send(&request, timeout)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout)),
            };

            let retryable = match &result {
                Ok(resp) => resp.is_server_error(),
                Err(e) => e.is_retryable(),
            };
            if !retryable || attempt > job.retries {
                return Outcome::from_attempt(result, attempt);
            }

            let delay = self.settings.backoff.delay(attempt);
            match &result {
                Ok(resp) => warn!(job_id = %job.id, attempt, status = resp.status, ?delay, "Attempt failed, retrying"),
                Err(e) => warn!(job_id = %job.id, attempt, error = %e, ?delay, "Attempt failed, retrying"),
            }
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(1000),
        };
        let first = backoff.delay(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(110));
        let third = backoff.delay(3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(440));
        for retry in [5, 10, 40] {
            assert_eq!(backoff.delay(retry), Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_timeout_resolution() {
        let settings = ExecutorSettings::from_config(&ExecutorConfig::default(), 5);
        let job_json = serde_json::json!({
            "name": "x", "schedule": "* * * * *", "endpoint": "http://x/", "method": "GET"
        });
        let req: crate::model::NewJob = serde_json::from_value(job_json).unwrap();
        let mut job = Job::create(uuid::Uuid::new_v4(), req, chrono::Utc::now(), &ExecutorConfig::default()).unwrap();

        assert_eq!(settings.timeout_for(&job), Duration::from_secs(30));
        job.timeout_secs = Some(5);
        assert_eq!(settings.timeout_for(&job), Duration::from_secs(5));
        job.timeout_secs = Some(10_000);
        assert_eq!(settings.timeout_for(&job), Duration::from_secs(300));
    }

    #[test]
    fn test_outcome_classification() {
        let resp = |status: u16| HttpResponse {
            status,
            status_text: status.to_string(),
            headers: Default::default(),
            body: b"hi".to_vec(),
            truncated: false,
        };
        let ok = Outcome::from_attempt(Ok(resp(204)), 1);
        assert_eq!(ok.status, LogStatus::Success);
        assert!(ok.error.is_none());
        assert_eq!(ok.body.as_deref(), Some("hi"));

        let redirect = Outcome::from_attempt(Ok(resp(302)), 1);
        assert_eq!(redirect.status, LogStatus::Failure);
        assert_eq!(redirect.response_code, Some(302));

        let net = Outcome::from_attempt(Err(TransportError::Connect("refused".into())), 3);
        assert_eq!(net.status, LogStatus::Failure);
        assert_eq!(net.attempts, 3);
        assert!(net.response_code.is_none());
    }
}
