//! Executor-facing completion reports.

use std::str::FromStr;

use axum::Router;
use axum::extract::{Path, State};
use axum::routing::post;
use axum::Json;
use serde::{Deserialize, Serialize};

use lanekeeper_core::{EntityId, WorkState};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/revision-works/{id}/complete",
        post(complete_revision_work),
    )
}

#[derive(Debug, Deserialize)]
struct CompleteRequest {
    state: WorkState,
}

#[derive(Serialize)]
struct CompleteResponse {
    id: EntityId,
    state: WorkState,
}

/// A builder finished (or gave up on) a revision work: record the outcome,
/// then run reactive dependency resolution so dependents unblock without
/// waiting for the next scheduling cycle.
async fn complete_revision_work(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<CompleteRequest>,
) -> Result<Json<CompleteResponse>, ApiError> {
    let id = EntityId::from_str(&id)
        .map_err(|_| ApiError::BadRequest(format!("Invalid revision work id: {}", id)))?;

    if !request.state.is_completed() {
        return Err(ApiError::BadRequest(format!(
            "'{}' is not a terminal state",
            request.state
        )));
    }

    let store = state.scheduler.store();
    // Ensure the row exists before mutating it.
    store.revision_work(id).await?;
    store
        .set_revision_work_result(id, request.state, true)
        .await?;
    state.scheduler.report_completed_revision_work(id).await?;

    Ok(Json(CompleteResponse {
        id,
        state: request.state,
    }))
}
