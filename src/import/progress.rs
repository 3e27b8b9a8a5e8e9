//! Progress reporting between batches.
//!
//! The engine publishes an integer percentage after each batch through a
//! [`ProgressSink`]. [`ProgressTracker`] owns the arithmetic and guarantees
//! the reported values never go backwards and end at exactly 100.

use tokio::sync::watch;

/// Receives progress percentages (0-100).
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: u8);
}

impl<F> ProgressSink for F
where
    F: Fn(u8) + Send + Sync,
{
    fn report(&self, percent: u8) {
        self(percent)
    }
}

impl ProgressSink for watch::Sender<u8> {
    fn report(&self, percent: u8) {
        // send_replace never fails, even when every receiver is gone.
        self.send_replace(percent);
    }
}

/// Sink that discards progress.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _percent: u8) {}
}

/// Monotonic progress computation for one run.
pub struct ProgressTracker<'a> {
    sink: &'a dyn ProgressSink,
    total: usize,
    last: u8,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(sink: &'a dyn ProgressSink, total: usize) -> Self {
        Self {
            sink,
            total,
            last: 0,
        }
    }

    /// Report progress after `processed` records; returns the value sent.
    pub fn advance(&mut self, processed: usize) -> u8 {
        let percent = if self.total == 0 || processed >= self.total {
            100
        } else {
            ((processed * 100) / self.total).min(99) as u8
        };

        self.last = self.last.max(percent);
        self.sink.report(self.last);
        self.last
    }

    pub fn last(&self) -> u8 {
        self.last
    }
}
