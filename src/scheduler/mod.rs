//! Cron scheduling.
//!
//! [`Scheduler`] is a cheap, cloneable handle. All queue mutation is
//! serialized through one engine task; callers only send commands.

pub mod cron;
mod engine;
pub mod queue;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use self::cron::Schedule;
use self::engine::{Command, Engine};
use crate::clock::SharedClock;
use crate::error::{Error, Result};
use crate::executor::Dispatcher;
use crate::model::{Job, JobId};

#[derive(Clone)]
pub struct Scheduler {
    commands: mpsc::Sender<Command>,
    clock: SharedClock,
}

impl Scheduler {
    /// Start the scheduling loop. It stops when `shutdown` is cancelled.
    pub fn spawn(
        dispatcher: Dispatcher,
        clock: SharedClock,
        command_buffer: usize,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(command_buffer.max(1));
        let engine = Engine::new(rx, dispatcher, clock.clone(), shutdown);
        let handle = tokio::spawn(engine.run());
        (Self { commands: tx, clock }, handle)
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.commands.send(cmd).await.map_err(|_| Error::SchedulerStopped)
    }

    /// Bring the queue in line with `job` after a create or update: active
    /// jobs are (re)queued at their next fire after now, inactive ones dropped.
    /// An unparsable schedule dequeues the job and is returned to the caller.
    pub async fn register(&self, job: &Job) -> Result<()> {
        self.register_from(job, self.clock.now()).await
    }

    async fn register_from(&self, job: &Job, anchor: DateTime<Utc>) -> Result<()> {
        if !job.active {
            return self.remove(job.id).await;
        }
        let schedule = match Schedule::parse(&job.schedule) {
            Ok(schedule) => schedule,
            Err(e) => {
                self.remove(job.id).await?;
                return Err(e.into());
            }
        };
        self.send(Command::Register {
            job_id: job.id,
            schedule,
            anchor,
        })
        .await
    }

    pub async fn remove(&self, job_id: JobId) -> Result<()> {
        self.send(Command::Remove { job_id }).await
    }

    /// Queue jobs loaded at startup. Each resumes from its last scheduled
    /// fire or the last time it was armed, whichever is later, so a fire
    /// missed while the process was down happens once, immediately. Returns
    /// how many were queued.
    pub async fn restore(&self, jobs: Vec<Job>) -> Result<usize> {
        let mut queued = 0;
        for job in jobs.iter().filter(|j| j.active) {
            let anchor = job.resume_anchor();
            match self.register_from(job, anchor).await {
                Ok(()) => queued += 1,
                Err(Error::SchedulerStopped) => return Err(Error::SchedulerStopped),
                Err(e) => warn!(job_id = %job.id, error = %e, "Skipping job with unusable schedule"),
            }
        }
        info!(queued, "Restored scheduled jobs");
        Ok(queued)
    }

    /// Queued jobs and their next fire times, earliest first.
    pub async fn snapshot(&self) -> Result<Vec<(JobId, DateTime<Utc>)>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| Error::SchedulerStopped)
    }
}
