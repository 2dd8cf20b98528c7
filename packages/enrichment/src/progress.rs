//! Progress reporting.
//!
//! The scheduler pushes a [`ProgressEvent`] after every finished row. How it
//! reaches a user (SSE, websocket, log line) is up to the [`ProgressSink`].

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

/// Snapshot sent after each finished row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Rows finished so far
    pub current: usize,
    pub total: usize,
    pub success_count: usize,
    pub error_count: usize,
}

impl ProgressEvent {
    /// Completion percentage, 0 to 100.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.current.min(self.total) * 100) / self.total) as u8
    }
}

/// Receives progress events. Called from worker tasks; must not block.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _event: ProgressEvent) {}
}

impl ProgressSink for mpsc::UnboundedSender<ProgressEvent> {
    fn on_progress(&self, event: ProgressEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.send(event);
    }
}

impl ProgressSink for watch::Sender<ProgressEvent> {
    fn on_progress(&self, event: ProgressEvent) {
        self.send_replace(event);
    }
}

/// Closure-backed sink, see [`from_fn`].
pub struct ProgressFn<F>(F);

impl<F> ProgressSink for ProgressFn<F>
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: ProgressEvent) {
        (self.0)(event)
    }
}

/// Wrap a closure as a [`ProgressSink`].
pub fn from_fn<F>(f: F) -> ProgressFn<F>
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    ProgressFn(f)
}
