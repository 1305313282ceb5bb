use crate::{
    CancelHandle, CancellationController, ExecutionRegistry, MetricsAggregator, PreparedTask,
    RuntimeConfig, RuntimeError, TaskOutcome, WorkerPool,
};
use crewcore::{
    Cancelled, EventBus, ExecutionError, ExecutionEvent, ExecutionInfo, ExecutionStatus,
    MetricsSnapshot, StopFlag,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

type CompleteCallback<T> = Box<dyn FnOnce(&T) + Send>;
type ErrorCallback = Box<dyn FnOnce(&anyhow::Error) + Send>;

/// Per-submission options: timeout and result callbacks.
pub struct Submission<T> {
    timeout: Option<Duration>,
    on_complete: Option<CompleteCallback<T>>,
    on_error: Option<ErrorCallback>,
}

impl<T> Submission<T> {
    pub fn new() -> Self {
        Self {
            timeout: None,
            on_complete: None,
            on_error: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Called with the work's result before `submit` returns it.
    pub fn on_complete(mut self, callback: impl FnOnce(&T) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Called with the work's error before `submit` re-raises it. Not called
    /// for timeouts or cancellations.
    pub fn on_error(mut self, callback: impl FnOnce(&anyhow::Error) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }
}

impl<T> Default for Submission<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs blocking crew work on a bounded worker pool and tracks its lifecycle.
///
/// Build one per process, share it by `Arc`, and call `shutdown` at teardown.
pub struct ExecutionManager {
    config: RuntimeConfig,
    pool: WorkerPool,
    registry: Arc<ExecutionRegistry>,
    metrics: Arc<MetricsAggregator>,
    cancellation: CancellationController,
    events: EventBus,
    shut_down: AtomicBool,
}

impl ExecutionManager {
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;

        let pool = WorkerPool::new(config.max_workers)?;
        let registry = Arc::new(ExecutionRegistry::new(config.retention_limit));
        let metrics = Arc::new(MetricsAggregator::new());
        let events = EventBus::new(config.event_buffer_size);
        let cancellation = CancellationController::new(
            Arc::clone(&registry),
            Arc::clone(&metrics),
            events.clone(),
        );

        Ok(Self {
            config,
            pool,
            registry,
            metrics,
            cancellation,
            events,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Run `work` on the pool and wait for it to settle.
    ///
    /// The calling task is suspended, not blocked, while the work runs. On
    /// success the work's value is returned; a work error is re-raised as
    /// `ExecutionError::Work` after the registry and metrics are updated.
    ///
    /// A timeout resolves the wait but cannot stop a worker thread that has
    /// already picked the work up: the stop flag is raised and the thread keeps
    /// running until the work yields or returns, and its late result is
    /// discarded. Work that had not started yet is never run.
    pub async fn submit<T, F>(
        &self,
        execution_id: impl Into<String>,
        work: F,
        submission: Submission<T>,
    ) -> Result<T, ExecutionError>
    where
        T: Send + 'static,
        F: FnOnce(StopFlag) -> anyhow::Result<T> + Send + 'static,
    {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ExecutionError::ShutDown);
        }

        let execution_id = execution_id.into();
        let stop = StopFlag::new();

        let worker_stop = stop.clone();
        let worker_events = self.events.clone();
        let worker_id = execution_id.clone();
        let PreparedTask {
            task,
            cancel,
            outcome,
        } = WorkerPool::prepare(move || {
            let worker = std::thread::current()
                .name()
                .unwrap_or("crew-worker")
                .to_string();
            tracing::debug!("Execution {} started on {}", worker_id, worker);
            worker_events.started(&worker_id, &worker);
            work(worker_stop)
        });

        let seq = self.registry.register_with(
            &execution_id,
            stop.clone(),
            Arc::clone(&cancel),
            || self.metrics.record_submitted(),
        )?;
        self.events.submitted(&execution_id);
        tracing::info!("Submitted execution {}", execution_id);

        let guard = SettleGuard {
            manager: self,
            execution_id: &execution_id,
            seq,
            stop: &stop,
            cancel: &cancel,
            armed: true,
        };

        if self.pool.enqueue(task).is_err() {
            guard.disarm();
            cancel.cancel();
            self.settle(&execution_id, seq, ExecutionStatus::Cancelled);
            return Err(ExecutionError::ShutDown);
        }

        let timeout = submission.timeout.or_else(|| self.config.default_timeout());
        let settled = match timeout {
            Some(limit) => tokio::time::timeout(limit, outcome).await.ok(),
            None => Some(outcome.await),
        };
        guard.disarm();

        match settled {
            None => {
                let limit = timeout.unwrap_or_default();
                stop.raise();
                // Work still in the queue must never start.
                cancel.cancel();
                self.settle(&execution_id, seq, ExecutionStatus::Timeout);
                tracing::warn!(
                    "Execution {} timed out after {:?}; its worker thread may still be running",
                    execution_id,
                    limit
                );
                Err(ExecutionError::Timeout {
                    execution_id,
                    timeout: limit,
                })
            }
            Some(Ok(TaskOutcome::Finished(Ok(value)))) => {
                self.settle(&execution_id, seq, ExecutionStatus::Completed);
                if let Some(callback) = submission.on_complete {
                    callback(&value);
                }
                Ok(value)
            }
            Some(Ok(TaskOutcome::Finished(Err(err)))) if err.is::<Cancelled>() => {
                self.settle(&execution_id, seq, ExecutionStatus::Cancelled);
                Err(ExecutionError::Cancelled { execution_id })
            }
            Some(Ok(TaskOutcome::Finished(Err(err)))) => {
                self.settle(&execution_id, seq, ExecutionStatus::Failed);
                tracing::error!("Execution {} failed: {}", execution_id, err);
                if let Some(callback) = submission.on_error {
                    callback(&err);
                }
                Err(ExecutionError::Work(err))
            }
            // Either cancelled while queued, or dropped by a closing pool.
            Some(Ok(TaskOutcome::Cancelled)) | Some(Err(_)) => {
                self.settle(&execution_id, seq, ExecutionStatus::Cancelled);
                Err(ExecutionError::Cancelled { execution_id })
            }
        }
    }

    /// Request a cooperative stop. See `CancellationController::request_stop`.
    pub fn request_stop(&self, execution_id: &str) -> bool {
        self.cancellation.request_stop(execution_id)
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Executions that have not reached a terminal state (RUNNING or STOPPING).
    pub fn get_active_executions(&self) -> HashMap<String, ExecutionInfo> {
        self.registry.active()
    }

    pub fn get_execution(&self, execution_id: &str) -> Option<ExecutionInfo> {
        self.registry.get(execution_id)
    }

    pub fn status(&self, execution_id: &str) -> Option<ExecutionStatus> {
        self.registry.status(execution_id)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Raise every live stop flag and close the pool.
    ///
    /// With `wait` the queued work is drained and all worker threads are
    /// joined (on the blocking pool, not the async scheduler). Without it,
    /// work that has not started is cancelled and running threads are left
    /// to finish on their own. Later calls are no-ops.
    pub async fn shutdown(&self, wait: bool) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let raised = self.cancellation.raise_all();
        tracing::info!(
            "Shutting down execution manager ({} live executions signalled)",
            raised
        );

        if !wait {
            let cancelled = self.cancellation.cancel_pending();
            if cancelled > 0 {
                tracing::info!("Abandoned {} queued executions", cancelled);
            }
        }

        let workers = self.pool.close();
        if wait {
            let joined = tokio::task::spawn_blocking(move || {
                for worker in workers {
                    if worker.join().is_err() {
                        tracing::error!("Worker thread panicked during shutdown");
                    }
                }
            })
            .await;
            if let Err(e) = joined {
                tracing::error!("Failed to join worker threads: {}", e);
            }
        }

        tracing::info!("Execution manager shut down");
    }

    fn settle(&self, execution_id: &str, seq: u64, status: ExecutionStatus) {
        let Some(duration) = self.registry.finish(execution_id, seq, status) else {
            return;
        };
        self.metrics.record_finished(status, duration);
        let duration_ms = duration.as_millis() as u64;
        self.events.finished(execution_id, status, duration_ms);
        tracing::info!(
            "Execution {} finished as {} in {}ms",
            execution_id,
            status,
            duration_ms
        );
    }
}

/// Settles the execution as CANCELLED if `submit` is dropped mid-wait.
struct SettleGuard<'a> {
    manager: &'a ExecutionManager,
    execution_id: &'a str,
    seq: u64,
    stop: &'a StopFlag,
    cancel: &'a Arc<dyn CancelHandle>,
    armed: bool,
}

impl SettleGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!(
            "Caller stopped waiting for execution {}; cancelling it",
            self.execution_id
        );
        self.stop.raise();
        self.cancel.cancel();
        self.manager
            .settle(self.execution_id, self.seq, ExecutionStatus::Cancelled);
    }
}
