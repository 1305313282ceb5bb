use crate::lock;
use crewcore::{ExecutionStatus, MetricsSnapshot};
use std::sync::Mutex;
use std::time::Duration;

/// Counters derived from registry transitions.
///
/// All counters sit behind one lock so every snapshot satisfies
/// `active + completed + failed + cancelled == total`.
#[derive(Default)]
pub struct MetricsAggregator {
    counters: Mutex<Counters>,
}

#[derive(Default)]
struct Counters {
    total: u64,
    active: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    timed_out: u64,
    total_duration: Duration,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new execution was registered.
    pub fn record_submitted(&self) {
        let mut counters = lock(&self.counters);
        counters.total += 1;
        counters.active += 1;
    }

    /// An execution moved into the terminal `status` after `duration`.
    pub fn record_finished(&self, status: ExecutionStatus, duration: Duration) {
        let mut counters = lock(&self.counters);
        match status {
            ExecutionStatus::Completed => counters.completed += 1,
            ExecutionStatus::Failed => counters.failed += 1,
            ExecutionStatus::Cancelled => counters.cancelled += 1,
            ExecutionStatus::Timeout => {
                counters.failed += 1;
                counters.timed_out += 1;
            }
            ExecutionStatus::Running | ExecutionStatus::Stopping => {
                tracing::warn!("Ignoring non-terminal status {} in metrics", status);
                return;
            }
        }
        counters.active = counters.active.saturating_sub(1);
        counters.total_duration += duration;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = lock(&self.counters);
        let finished = counters.completed + counters.failed + counters.cancelled;
        let total_duration_ms = counters.total_duration.as_millis() as u64;
        MetricsSnapshot {
            total: counters.total,
            active: counters.active,
            completed: counters.completed,
            failed: counters.failed,
            cancelled: counters.cancelled,
            timed_out: counters.timed_out,
            total_duration_ms,
            average_duration_ms: (finished > 0)
                .then(|| counters.total_duration.as_micros() as f64 / 1000.0 / finished as f64),
        }
    }
}
