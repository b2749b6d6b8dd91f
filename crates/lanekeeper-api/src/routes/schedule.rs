//! The scheduling trigger endpoint.
//!
//! `GET/POST /schedule?repo=...&lane_id=...&forcefullupdate=...&stream_log=...`
//!
//! With `stream_log=true` (the default) the response body is the scheduling
//! log, chunked, completing only when the triggered update(s) finish.
//! Validation failures and scheduler errors come back as plain-text lines,
//! mirroring what a streaming client would see; one repository's failure
//! never takes the process down.

use std::str::FromStr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use tracing::info;

use lanekeeper_core::EntityId;
use lanekeeper_core::progress::ProgressLog;
use lanekeeper_scheduler::{ScheduledUpdate, SchedulerService};

use crate::AppState;
use crate::stream::{ChannelLog, body_from_log};

pub fn router() -> Router<AppState> {
    Router::new().route("/schedule", get(schedule).post(schedule))
}

#[derive(Debug, Deserialize)]
pub struct ScheduleParams {
    pub repo: Option<String>,
    pub lane_id: Option<String>,
    pub forcefullupdate: Option<String>,
    pub stream_log: Option<String>,
}

/// Which lanes a trigger addresses.
#[derive(Debug, PartialEq, Eq)]
pub enum LaneSelector {
    All,
    One(EntityId),
}

/// A validated trigger request.
#[derive(Debug, PartialEq, Eq)]
pub struct ScheduleRequest {
    pub repo: Option<String>,
    pub lane: Option<LaneSelector>,
    pub full_update: bool,
    pub stream_log: bool,
}

impl ScheduleRequest {
    /// Validate raw query parameters. Errors are the plain-text lines the
    /// caller sees.
    pub fn parse(params: &ScheduleParams) -> Result<ScheduleRequest, String> {
        let lane = match params.lane_id.as_deref() {
            None | Some("") => None,
            Some("all") => Some(LaneSelector::All),
            Some(raw) => match EntityId::from_str(raw) {
                Ok(id) => Some(LaneSelector::One(id)),
                Err(_) => return Err(format!("Invalid lane id: {}", raw)),
            },
        };

        let full_update = parse_bool("forcefullupdate", params.forcefullupdate.as_deref(), false)?;
        let stream_log = parse_bool("stream_log", params.stream_log.as_deref(), true)?;

        let repo = params.repo.clone().filter(|r| !r.is_empty());
        if repo.is_none() && lane.is_none() {
            return Err("Either 'repo' or 'lane_id' must be given.".to_string());
        }

        Ok(ScheduleRequest {
            repo,
            lane,
            full_update,
            stream_log,
        })
    }
}

fn parse_bool(name: &str, raw: Option<&str>, default: bool) -> Result<bool, String> {
    match raw {
        None | Some("") => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| format!("Invalid value '{}' for parameter '{}'", raw, name)),
    }
}

async fn schedule(State(state): State<AppState>, Query(params): Query<ScheduleParams>) -> Response {
    let request = match ScheduleRequest::parse(&params) {
        Ok(request) => request,
        Err(message) => return message.into_response(),
    };

    info!(repo = ?request.repo, lane = ?request.lane, full = request.full_update, "schedule trigger");

    let updates = match enqueue_updates(&state.scheduler, &request).await {
        Ok(updates) => updates,
        Err(message) => return message.into_response(),
    };

    if updates.is_empty() {
        return "Nothing to schedule.".into_response();
    }

    if !request.stream_log {
        return format!("Queued {} repository update(s).\n", updates.len()).into_response();
    }

    // Stream the aggregated log of all triggered updates until they finish.
    let (sink, rx) = ChannelLog::new();
    let sink = Arc::new(sink);
    for update in &updates {
        update.add_log_sink(sink.clone());
    }

    tokio::spawn(async move {
        for update in &updates {
            update.wait_for_completion().await;
        }
        sink.log("Scheduler finished.");
        sink.close();
    });

    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body_from_log(rx),
    )
        .into_response()
}

async fn enqueue_updates(
    scheduler: &SchedulerService,
    request: &ScheduleRequest,
) -> Result<Vec<Arc<ScheduledUpdate>>, String> {
    let lane_filter = match request.lane {
        Some(LaneSelector::One(id)) => Some(vec![id]),
        _ => None,
    };

    if let Some(repo) = &request.repo {
        return Ok(vec![scheduler.enqueue(repo, request.full_update, lane_filter)]);
    }

    scheduler
        .enqueue_all(request.full_update, lane_filter)
        .await
        .map_err(|err| format!("Could not enqueue updates: {}", err))
}
