use crate::ExecutionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Caller-supplied execution identifier.
pub type ExecutionId = String;

/// Read-only view of one execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stop_requested: bool,
    /// Wall time from registration to the terminal transition.
    pub duration_ms: Option<u64>,
}

/// Aggregate counters over every execution submitted so far.
///
/// `active + completed + failed + cancelled == total` holds for every
/// snapshot. Timeouts are included in `failed` and also reported on their own
/// in `timed_out`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub total_duration_ms: u64,
    pub average_duration_ms: Option<f64>,
}

impl MetricsSnapshot {
    /// Number of executions that reached a terminal state.
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.cancelled
    }
}
