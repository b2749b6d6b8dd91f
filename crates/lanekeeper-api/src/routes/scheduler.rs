//! Scheduler queue status.

use std::collections::HashMap;

use axum::Router;
use axum::extract::State;
use axum::routing::get;
use axum::Json;
use serde::Serialize;

use lanekeeper_scheduler::queue::UpdateSnapshot;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/scheduler/queue", get(queue_status))
}

#[derive(Serialize)]
struct QueueStatus {
    waiting: Vec<UpdateSnapshot>,
    working: Vec<UpdateSnapshot>,
    /// Repository URL -> names of the lanes referencing it.
    repositories: HashMap<String, Vec<String>>,
}

async fn queue_status(State(state): State<AppState>) -> Result<Json<QueueStatus>, ApiError> {
    let queue = state.scheduler.queue();

    let mut repositories: HashMap<String, Vec<String>> = HashMap::new();
    for lane in state.scheduler.store().lanes().await? {
        for repository in lane.repositories() {
            repositories
                .entry(repository.url)
                .or_default()
                .push(lane.name.clone());
        }
    }

    Ok(Json(QueueStatus {
        waiting: queue.waiting().iter().map(|u| u.snapshot()).collect(),
        working: queue.working().iter().map(|u| u.snapshot()).collect(),
        repositories,
    }))
}
