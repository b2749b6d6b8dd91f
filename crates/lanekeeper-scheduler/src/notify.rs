//! Notification dispatch.
//!
//! The scheduler emits an event whenever a revision work reaches a terminal
//! completed state; delivery (mail, IRC, webhooks) lives elsewhere and
//! plugs in behind [`NotificationSink`]. Events are consumed by a bounded
//! worker pool so a slow sink cannot stall the scheduler, and delivery
//! failures are logged with full context rather than discarded.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use lanekeeper_core::{EntityId, WorkState};

const QUEUE_DEPTH: usize = 256;

/// A revision work reached a terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    pub lane_id: EntityId,
    pub host_id: EntityId,
    pub revision_id: EntityId,
    pub state: WorkState,
    pub message: String,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, event: &NotificationEvent) -> lanekeeper_core::Result<()>;
}

/// Writes events to the log. The default sink.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, event: &NotificationEvent) -> lanekeeper_core::Result<()> {
        info!(
            lane_id = %event.lane_id,
            host_id = %event.host_id,
            revision_id = %event.revision_id,
            state = %event.state,
            "{}",
            event.message
        );
        Ok(())
    }
}

/// Fans events out to a sink from a bounded queue.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<NotificationEvent>,
}

impl Notifier {
    /// Spawn `workers` consumer tasks delivering to `sink`.
    pub fn start(sink: Arc<dyn NotificationSink>, workers: usize) -> Self {
        let (tx, rx) = mpsc::channel::<NotificationEvent>(QUEUE_DEPTH);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                loop {
                    let event = rx.lock().await.recv().await;
                    let Some(event) = event else {
                        break;
                    };
                    if let Err(err) = sink.deliver(&event).await {
                        error!(
                            worker,
                            lane_id = %event.lane_id,
                            host_id = %event.host_id,
                            revision_id = %event.revision_id,
                            state = %event.state,
                            error = %err,
                            "notification delivery failed"
                        );
                    }
                }
            });
        }

        Self { tx }
    }

    /// Fire-and-forget. A full queue is logged, not blocked on.
    pub fn emit(&self, event: NotificationEvent) {
        if let Err(err) = self.tx.try_send(event) {
            warn!(error = %err, "dropping notification event");
        }
    }
}
