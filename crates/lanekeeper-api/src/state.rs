//! Application state.

use std::sync::Arc;

use lanekeeper_scheduler::SchedulerService;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<SchedulerService>,
    /// Secret for webhook signature verification, if configured.
    pub webhook_secret: Option<String>,
}

impl AppState {
    pub fn new(scheduler: Arc<SchedulerService>, webhook_secret: Option<String>) -> Self {
        Self {
            scheduler,
            webhook_secret,
        }
    }
}
