//! Route registration.

use axum::Router;
use axum::routing::get;

use crate::AppState;

pub mod schedule;
pub mod scheduler;
pub mod webhooks;
pub mod works;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(schedule::router())
        .merge(scheduler::router())
        .nest("/webhooks", webhooks::router())
        .merge(works::router())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
