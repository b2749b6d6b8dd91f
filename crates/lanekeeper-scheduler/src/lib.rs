//! Scheduler core for the lanekeeper CI coordinator.
//!
//! One background dispatch loop pulls [`queue::ScheduledUpdate`]s off the
//! [`queue::SchedulerQueue`] and hands each to a semaphore-bounded worker
//! which runs the full per-repository pipeline: fetch, revision import, work
//! expansion, dependency resolution.

pub mod deps;
pub mod expand;
pub mod import;
pub mod lock;
pub mod notify;
pub mod queue;
pub mod service;

#[cfg(test)]
pub(crate) mod testkit;

use std::time::Duration;

use thiserror::Error;

pub use notify::{LogSink, NotificationEvent, NotificationSink, Notifier};
pub use queue::{ScheduledUpdate, SchedulerQueue};
pub use service::SchedulerService;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Db(#[from] lanekeeper_db::DbError),

    #[error(transparent)]
    Vcs(#[from] lanekeeper_vcs::VcsError),
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// Tunables for the dispatcher and its workers.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Repository updates processed in parallel.
    pub max_concurrent_updates: usize,
    /// Name of the cross-process advisory lock.
    pub lock_name: String,
    /// Backoff between advisory-lock acquisition attempts.
    pub lock_retry: Duration,
    /// Enqueue updates for every known repository at this interval, if set.
    pub poll_interval: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_updates: 4,
            lock_name: "lanekeeper-scheduler".to_string(),
            lock_retry: Duration::from_secs(15),
            poll_interval: None,
        }
    }
}
