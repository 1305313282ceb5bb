use crate::{ExecutionRegistry, MetricsAggregator};
use crewcore::{EventBus, ExecutionStatus};
use std::sync::Arc;
use std::time::Duration;

/// Stop-flag and task-cancellation logic over the shared registry.
///
/// Two outcomes are kept apart. A task that has not started is prevented
/// from ever running and settles as CANCELLED right away. A task already on a
/// worker thread only gets its stop flag raised and moves to STOPPING; the
/// thread keeps going until the work notices the flag or finishes.
pub struct CancellationController {
    registry: Arc<ExecutionRegistry>,
    metrics: Arc<MetricsAggregator>,
    events: EventBus,
}

impl CancellationController {
    pub fn new(
        registry: Arc<ExecutionRegistry>,
        metrics: Arc<MetricsAggregator>,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            metrics,
            events,
        }
    }

    /// Ask a RUNNING execution to stop.
    ///
    /// Returns false for unknown ids, terminal ids, and executions that are
    /// already STOPPING.
    pub fn request_stop(&self, execution_id: &str) -> bool {
        let mut state = self.registry.state();
        let Some(record) = state.get_mut(execution_id) else {
            tracing::debug!("Stop requested for unknown execution {}", execution_id);
            return false;
        };
        if record.status != ExecutionStatus::Running {
            tracing::debug!(
                "Stop requested for execution {} in state {}",
                execution_id,
                record.status
            );
            return false;
        }

        record.stop.raise();
        if record.task.cancel() {
            let seq = record.seq;
            let settled = state.finish(execution_id, seq, ExecutionStatus::Cancelled);
            drop(state);

            tracing::info!("Execution {} cancelled before it started", execution_id);
            self.events.stop_requested(execution_id, true);
            if let Some(duration) = settled {
                self.record_cancelled(execution_id, duration);
            }
        } else {
            record.status = ExecutionStatus::Stopping;
            drop(state);

            tracing::warn!(
                "Execution {} is already running; stop flag raised, waiting for it to yield",
                execution_id
            );
            self.events.stop_requested(execution_id, false);
        }
        true
    }

    /// Raise the stop flag of every live execution. Returns how many were raised.
    pub fn raise_all(&self) -> usize {
        let mut state = self.registry.state();
        let mut raised = 0;
        for (_, record) in state.live_mut() {
            record.stop.raise();
            raised += 1;
        }
        raised
    }

    /// Cancel every live execution whose task has not started yet.
    pub fn cancel_pending(&self) -> usize {
        let mut state = self.registry.state();
        let pending: Vec<(String, u64)> = state
            .live_mut()
            .filter_map(|(id, record)| {
                record.stop.raise();
                record.task.cancel().then(|| (id.clone(), record.seq))
            })
            .collect();

        let settled: Vec<(String, Duration)> = pending
            .into_iter()
            .filter_map(|(id, seq)| {
                state
                    .finish(&id, seq, ExecutionStatus::Cancelled)
                    .map(|duration| (id, duration))
            })
            .collect();
        drop(state);

        for (execution_id, duration) in &settled {
            self.events.stop_requested(execution_id, true);
            self.record_cancelled(execution_id, *duration);
        }
        settled.len()
    }

    fn record_cancelled(&self, execution_id: &str, duration: Duration) {
        self.metrics
            .record_finished(ExecutionStatus::Cancelled, duration);
        self.events.finished(
            execution_id,
            ExecutionStatus::Cancelled,
            duration.as_millis() as u64,
        );
    }
}
