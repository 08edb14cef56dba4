use std::sync::Arc;

use crate::clock::SharedClock;
use crate::config::Config;
use crate::executor::transport::Transport;
use crate::executor::Dispatcher;
use crate::scheduler::Scheduler;
use crate::storage::{JobStore, LogRecorder, UserStore};

/// Handles shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub jobs: JobStore,
    pub logs: LogRecorder,
    pub users: UserStore,
    pub scheduler: Scheduler,
    pub dispatcher: Dispatcher,
    /// Used by the endpoint probe; job runs go through the dispatcher.
    pub transport: Arc<dyn Transport>,
    pub clock: SharedClock,
    pub config: Arc<Config>,
}
