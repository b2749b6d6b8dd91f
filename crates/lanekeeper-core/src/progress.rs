//! Progress log sinks.
//!
//! Scheduler components report progress through [`ProgressLog`] without
//! coupling to a transport. Sinks are fan-out-able ([`AggregateLog`]) and
//! cheap; `log` must never block.

use std::sync::{Arc, Mutex, RwLock};

/// A sink for human-readable scheduling progress lines.
pub trait ProgressLog: Send + Sync {
    fn log(&self, line: &str);
}

/// Forwards progress lines to `tracing`. The ambient default.
#[derive(Debug, Default)]
pub struct TracingLog;

impl ProgressLog for TracingLog {
    fn log(&self, line: &str) {
        tracing::info!(target: "lanekeeper::progress", "{}", line);
    }
}

/// Buffers progress lines in memory, e.g. to attach one repository's fetch
/// log to every lane that references the repository.
#[derive(Debug, Default)]
pub struct MemoryLog {
    lines: Mutex<Vec<String>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn contents(&self) -> String {
        self.lines().join("\n")
    }
}

impl ProgressLog for MemoryLog {
    fn log(&self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line.to_string());
    }
}

/// Fans one stream of progress lines out to several sinks. Sinks can be
/// attached after construction (an HTTP caller joining an in-flight update).
#[derive(Default)]
pub struct AggregateLog {
    sinks: RwLock<Vec<Arc<dyn ProgressLog>>>,
}

impl AggregateLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Arc<dyn ProgressLog>) -> Self {
        let log = Self::new();
        log.add_sink(sink);
        log
    }

    pub fn add_sink(&self, sink: Arc<dyn ProgressLog>) {
        self.sinks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(sink);
    }
}

impl ProgressLog for AggregateLog {
    fn log(&self, line: &str) {
        for sink in self.sinks.read().unwrap_or_else(|e| e.into_inner()).iter() {
            sink.log(line);
        }
    }
}
