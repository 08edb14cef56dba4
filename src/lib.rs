//! cronix -- scheduler and execution engine for HTTP cron jobs.
//!
//! The crate wires a cron [`scheduler`] to an HTTP [`executor`], persists
//! jobs and their run logs in SQLite ([`storage`]), and exposes everything
//! through a JSON [`api`].

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod model;
pub mod scheduler;
pub mod shutdown;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::state::AppState;
use crate::clock::{SharedClock, SystemClock};
use crate::config::{Config, LogFormat, LoggingConfig};
use crate::executor::transport::{ReqwestTransport, Transport};
use crate::executor::{Dispatcher, Executor, ExecutorSettings};
use crate::scheduler::Scheduler;
use crate::storage::{JobStore, LogRecorder, Pool, RetentionPolicy, UserStore};

pub use crate::error::Error;

/// Install the global tracing subscriber. `RUST_LOG` overrides the configured
/// level. Safe to call more than once; later calls are ignored.
pub fn init_tracing(cfg: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _ = match cfg.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

/// A running service: scheduler loop, worker pool and log janitor.
pub struct App {
    state: AppState,
    shutdown: CancellationToken,
    scheduler_task: JoinHandle<()>,
    janitor_task: JoinHandle<()>,
}

impl App {
    /// Build every component, restore active jobs into the scheduler and
    /// start the background tasks. Everything stops when `shutdown` fires.
    pub async fn start(
        config: Arc<Config>,
        pool: Pool,
        clock: SharedClock,
        transport: Arc<dyn Transport>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let jobs = JobStore::new(pool.clone());
        let logs = LogRecorder::new(pool.clone());
        let users = UserStore::new(pool);

        let executor = Executor::new(
            Arc::clone(&transport),
            logs.clone(),
            clock.clone(),
            ExecutorSettings::from_config(&config.executor, config.logs.max_per_job),
        );
        let dispatcher = Dispatcher::new(executor, jobs.clone(), config.executor.max_concurrent);
        let (scheduler, scheduler_task) = Scheduler::spawn(
            dispatcher.clone(),
            clock.clone(),
            config.scheduler.command_buffer,
            shutdown.clone(),
        );

        let active = jobs.list_active().context("failed to load active jobs")?;
        scheduler.restore(active).await?;

        let janitor_task = tokio::spawn(run_log_janitor(
            logs.clone(),
            clock.clone(),
            RetentionPolicy::from(&config.logs),
            Duration::from_secs(config.logs.cleanup_interval_secs),
            shutdown.clone(),
        ));

        let state = AppState {
            jobs,
            logs,
            users,
            scheduler,
            dispatcher,
            transport,
            clock,
            config,
        };
        Ok(Self {
            state,
            shutdown,
            scheduler_task,
            janitor_task,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        api::router(self.state.clone())
    }

    /// Stop scheduling and give in-flight runs `grace` to finish.
    /// Returns whether every run finished in time.
    pub async fn stop(self, grace: Duration) -> bool {
        self.shutdown.cancel();
        if let Err(e) = self.scheduler_task.await {
            error!(error = %e, "Scheduler task ended abnormally");
        }
        let _ = self.janitor_task.await;
        self.state.dispatcher.drain(grace).await
    }
}

/// Periodically apply the retention policy until shutdown.
async fn run_log_janitor(
    logs: LogRecorder,
    clock: SharedClock,
    policy: RetentionPolicy,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        match logs.cleanup(&policy, clock.now()) {
            Ok(report) if report.total() > 0 => {
                info!(expired = report.expired, over_cap = report.over_cap, "Old logs removed");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Log cleanup failed"),
        }
    }
}

/// Run the service until SIGINT or SIGTERM.
pub async fn serve(config: Config) -> Result<()> {
    let shutdown = shutdown::install_shutdown_handler().context("failed to install signal handlers")?;

    let config = Arc::new(config);
    info!(db = %config.storage.db_path.display(), "Opening database");
    let pool = storage::open_pool(&config.storage.db_path)
        .with_context(|| format!("failed to open database {}", config.storage.db_path.display()))?;
    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new()?);

    let app = App::start(
        Arc::clone(&config),
        pool,
        Arc::new(SystemClock),
        transport,
        shutdown.clone(),
    )
    .await?;

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    info!(addr = %listener.local_addr()?, "cronix listening");

    axum::serve(listener, app.router())
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("HTTP server failed")?;

    let grace = Duration::from_secs(config.shutdown.grace_secs);
    if app.stop(grace).await {
        info!("Shutdown complete");
    }
    Ok(())
}
