//! Wall-clock sources.
//!
//! The scheduler and executor read "now" through [`Clock`] so that tests can
//! drive them with tokio's paused time instead of the real clock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A wall clock that advances with tokio's monotonic clock.
///
/// Pinned to `origin` at construction; under `tokio::time::pause` it moves
/// only when the runtime advances time, which makes fire times reproducible.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: DateTime<Utc>,
    anchor: Instant,
}

impl TokioClock {
    pub fn starting_at(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            anchor: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.anchor);
        // Elapsed time always fits; fall back to the origin rather than panic.
        match chrono::Duration::from_std(elapsed) {
            Ok(d) => self.origin + d,
            Err(_) => self.origin,
        }
    }
}
