//! The scheduling loop.
//!
//! A single task owns the [`FireQueue`]. It sleeps until the earliest fire
//! time, hands due jobs to the dispatcher, and re-arms them. Registration
//! changes arrive over a channel and wake the loop immediately.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cron::Schedule;
use super::queue::FireQueue;
use crate::clock::SharedClock;
use crate::executor::Dispatcher;
use crate::model::JobId;

pub(crate) enum Command {
    /// Queue a job at its first fire time after `anchor`. A fire time that
    /// has already passed is due immediately (at most once).
    Register {
        job_id: JobId,
        schedule: Schedule,
        anchor: DateTime<Utc>,
    },
    Remove {
        job_id: JobId,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<(JobId, DateTime<Utc>)>>,
    },
}

pub(crate) struct Engine {
    queue: FireQueue,
    commands: mpsc::Receiver<Command>,
    dispatcher: Dispatcher,
    clock: SharedClock,
    shutdown: CancellationToken,
}

impl Engine {
    pub(crate) fn new(
        commands: mpsc::Receiver<Command>,
        dispatcher: Dispatcher,
        clock: SharedClock,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue: FireQueue::new(),
            commands,
            dispatcher,
            clock,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("Scheduler started");
        loop {
            let now = self.clock.now();
            for due in self.queue.pop_due(now) {
                debug!(job_id = %due.job_id, fire_at = %due.fire_at, "Fire due");
                self.dispatcher.dispatch_scheduled(due.job_id, due.fire_at);
            }

            let wait = self
                .queue
                .peek()
                .map(|at| (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO));

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.apply(cmd),
                    None => break,
                },
                _ = tokio::time::sleep(wait.unwrap_or_default()), if wait.is_some() => {}
            }
        }
        info!(queued = self.queue.len(), "Scheduler stopped");
    }

    fn apply(&mut self, cmd: Command) {
        match cmd {
            Command::Register {
                job_id,
                schedule,
                anchor,
            } => {
                let now = self.clock.now();
                match schedule.next_after(anchor) {
                    Ok(next) if next <= now => {
                        info!(%job_id, missed = %next, "Fire time passed while offline; catching up once");
                        self.queue.insert(job_id, schedule, now);
                    }
                    Ok(next) => {
                        debug!(%job_id, next = %next, "Job queued");
                        self.queue.insert(job_id, schedule, next);
                    }
                    Err(e) => {
                        warn!(%job_id, error = %e, "Job not queued");
                        self.queue.remove(job_id);
                    }
                }
            }
            Command::Remove { job_id } => {
                if self.queue.remove(job_id) {
                    debug!(%job_id, "Job dequeued");
                }
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.queue.snapshot());
            }
        }
    }
}
