use crate::{ExecutionId, ExecutionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lifecycle events emitted by the execution runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    Submitted {
        execution_id: ExecutionId,
        timestamp: DateTime<Utc>,
    },
    Started {
        execution_id: ExecutionId,
        worker: String,
        timestamp: DateTime<Utc>,
    },
    StopRequested {
        execution_id: ExecutionId,
        /// True when the work was prevented from starting at all.
        prevented_start: bool,
        timestamp: DateTime<Utc>,
    },
    Finished {
        execution_id: ExecutionId,
        status: ExecutionStatus,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            ExecutionEvent::Submitted { execution_id, .. }
            | ExecutionEvent::Started { execution_id, .. }
            | ExecutionEvent::StopRequested { execution_id, .. }
            | ExecutionEvent::Finished { execution_id, .. } => execution_id,
        }
    }
}

/// Process-wide broadcast of execution events.
///
/// Sending never blocks and never fails: with no subscribers the event is
/// dropped, and slow subscribers observe `RecvError::Lagged`.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn submitted(&self, execution_id: &str) {
        self.emit(ExecutionEvent::Submitted {
            execution_id: execution_id.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn started(&self, execution_id: &str, worker: &str) {
        self.emit(ExecutionEvent::Started {
            execution_id: execution_id.to_string(),
            worker: worker.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn stop_requested(&self, execution_id: &str, prevented_start: bool) {
        self.emit(ExecutionEvent::StopRequested {
            execution_id: execution_id.to_string(),
            prevented_start,
            timestamp: Utc::now(),
        });
    }

    pub fn finished(&self, execution_id: &str, status: ExecutionStatus, duration_ms: u64) {
        self.emit(ExecutionEvent::Finished {
            execution_id: execution_id.to_string(),
            status,
            duration_ms,
            timestamp: Utc::now(),
        });
    }
}
