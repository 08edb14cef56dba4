use thiserror::Error;

use crate::executor::transport::TransportError;
use crate::model::{JobId, ValidationError};
use crate::scheduler::cron::CronError;
use crate::storage::StoreError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Cron(#[from] CronError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("job {0} is already running")]
    Busy(JobId),

    #[error("scheduler is not running")]
    SchedulerStopped,

    /// The probed endpoint could not be reached.
    #[error("endpoint request failed: {0}")]
    Upstream(TransportError),

    #[error("run was aborted: {0}")]
    RunAborted(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

pub type Result<T> = std::result::Result<T, Error>;
