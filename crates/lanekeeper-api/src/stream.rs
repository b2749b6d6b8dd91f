//! Streaming a scheduling log as an HTTP response body.

use std::convert::Infallible;
use std::sync::Mutex;

use axum::body::{Body, Bytes};
use tokio::sync::mpsc;

use lanekeeper_core::progress::ProgressLog;

/// A progress sink that forwards lines into an mpsc channel. Closing it ends
/// the paired response body; lines logged after close are dropped.
pub struct ChannelLog {
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl ChannelLog {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Drop the sender so the receiving body stream terminates.
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

impl ProgressLog for ChannelLog {
    fn log(&self, line: &str) {
        if let Some(tx) = self.tx.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            let _ = tx.send(line.to_string());
        }
    }
}

/// A chunked body yielding one line per logged progress message, completing
/// when the channel closes.
pub fn body_from_log(rx: mpsc::UnboundedReceiver<String>) -> Body {
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let line = rx.recv().await?;
        let chunk = Bytes::from(format!("{}\n", line));
        Some((Ok::<_, Infallible>(chunk), rx))
    });
    Body::from_stream(stream)
}
