use crate::{lock, CancelHandle};
use chrono::{DateTime, Utc};
use crewcore::{ExecutionError, ExecutionInfo, ExecutionStatus, StopFlag};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Book-keeping for one execution.
pub(crate) struct ExecutionRecord {
    /// Distinguishes this run from earlier runs that reused the same id.
    pub(crate) seq: u64,
    pub(crate) status: ExecutionStatus,
    pub(crate) stop: StopFlag,
    pub(crate) task: Arc<dyn CancelHandle>,
    started_at: DateTime<Utc>,
    started: Instant,
    finished_at: Option<DateTime<Utc>>,
    duration: Option<Duration>,
}

impl ExecutionRecord {
    fn info(&self, execution_id: &str) -> ExecutionInfo {
        ExecutionInfo {
            execution_id: execution_id.to_string(),
            status: self.status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            stop_requested: self.stop.is_raised(),
            duration_ms: self.duration.map(|d| d.as_millis() as u64),
        }
    }
}

pub(crate) struct RegistryState {
    records: HashMap<String, ExecutionRecord>,
    /// Terminal runs in the order they settled, oldest first.
    terminal_order: VecDeque<(String, u64)>,
    next_seq: u64,
    retention_limit: usize,
}

impl RegistryState {
    pub(crate) fn get_mut(&mut self, execution_id: &str) -> Option<&mut ExecutionRecord> {
        self.records.get_mut(execution_id)
    }

    pub(crate) fn live_mut(&mut self) -> impl Iterator<Item = (&String, &mut ExecutionRecord)> {
        self.records
            .iter_mut()
            .filter(|(_, record)| record.status.is_live())
    }

    /// Move run `seq` of `execution_id` into the terminal `status`.
    ///
    /// Returns the run's duration if this call performed the transition, and
    /// `None` if the run is unknown, already terminal, or was replaced.
    pub(crate) fn finish(
        &mut self,
        execution_id: &str,
        seq: u64,
        status: ExecutionStatus,
    ) -> Option<Duration> {
        debug_assert!(status.is_terminal());

        let record = self.records.get_mut(execution_id)?;
        if record.seq != seq || record.status.is_terminal() {
            return None;
        }

        let duration = record.started.elapsed();
        record.status = status;
        record.finished_at = Some(Utc::now());
        record.duration = Some(duration);

        self.terminal_order.push_back((execution_id.to_string(), seq));
        self.prune();
        Some(duration)
    }

    fn prune(&mut self) {
        while self.terminal_order.len() > self.retention_limit {
            let Some((execution_id, seq)) = self.terminal_order.pop_front() else {
                break;
            };
            let evict = self
                .records
                .get(&execution_id)
                .map_or(false, |r| r.seq == seq && r.status.is_terminal());
            if evict {
                self.records.remove(&execution_id);
                tracing::debug!("Evicted execution record {}", execution_id);
            }
        }
    }
}

/// In-memory map from execution id to its record.
///
/// Live records stay until they settle. Terminal records are retained for
/// inspection up to the retention limit, after which the earliest-settled are
/// evicted first.
pub struct ExecutionRegistry {
    state: Mutex<RegistryState>,
}

impl ExecutionRegistry {
    pub fn new(retention_limit: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                records: HashMap::new(),
                terminal_order: VecDeque::new(),
                next_seq: 0,
                retention_limit: retention_limit.max(1),
            }),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, RegistryState> {
        lock(&self.state)
    }

    /// Register a new RUNNING execution and return its run number.
    ///
    /// Fails with `ExecutionError::Duplicate` while another run with the same
    /// id is still live. A retained terminal record with that id is replaced.
    pub fn register(
        &self,
        execution_id: &str,
        stop: StopFlag,
        task: Arc<dyn CancelHandle>,
    ) -> Result<u64, ExecutionError> {
        self.register_with(execution_id, stop, task, || ())
    }

    /// `register`, running `on_registered` before the registry lock is
    /// released. Nothing can settle the new run until `on_registered` returns.
    pub fn register_with(
        &self,
        execution_id: &str,
        stop: StopFlag,
        task: Arc<dyn CancelHandle>,
        on_registered: impl FnOnce(),
    ) -> Result<u64, ExecutionError> {
        let mut state = self.state();

        if let Some(existing) = state.records.get(execution_id) {
            if existing.status.is_live() {
                return Err(ExecutionError::Duplicate(execution_id.to_string()));
            }
            state.terminal_order.retain(|(id, _)| id != execution_id);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.records.insert(
            execution_id.to_string(),
            ExecutionRecord {
                seq,
                status: ExecutionStatus::Running,
                stop,
                task,
                started_at: Utc::now(),
                started: Instant::now(),
                finished_at: None,
                duration: None,
            },
        );
        on_registered();
        Ok(seq)
    }

    pub fn finish(&self, execution_id: &str, seq: u64, status: ExecutionStatus) -> Option<Duration> {
        self.state().finish(execution_id, seq, status)
    }

    pub fn status(&self, execution_id: &str) -> Option<ExecutionStatus> {
        self.state().records.get(execution_id).map(|r| r.status)
    }

    pub fn get(&self, execution_id: &str) -> Option<ExecutionInfo> {
        self.state()
            .records
            .get(execution_id)
            .map(|r| r.info(execution_id))
    }

    /// Snapshot of every execution that has not reached a terminal state.
    pub fn active(&self) -> HashMap<String, ExecutionInfo> {
        self.state()
            .records
            .iter()
            .filter(|(_, r)| r.status.is_live())
            .map(|(id, r)| (id.clone(), r.info(id)))
            .collect()
    }

    pub fn terminal_count(&self) -> usize {
        self.state().terminal_order.len()
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkerPool;

    fn handle() -> Arc<dyn CancelHandle> {
        WorkerPool::prepare(|| Ok(())).cancel
    }

    #[test]
    fn terminal_records_do_not_transition_again() {
        let registry = ExecutionRegistry::new(10);
        let seq = registry.register("a", StopFlag::new(), handle()).unwrap();

        assert!(registry.finish("a", seq, ExecutionStatus::Completed).is_some());
        assert!(registry.finish("a", seq, ExecutionStatus::Failed).is_none());
        assert_eq!(registry.status("a"), Some(ExecutionStatus::Completed));
    }

    #[test]
    fn live_duplicates_are_rejected() {
        let registry = ExecutionRegistry::new(10);
        registry.register("a", StopFlag::new(), handle()).unwrap();

        let err = registry.register("a", StopFlag::new(), handle()).unwrap_err();
        assert!(matches!(err, ExecutionError::Duplicate(id) if id == "a"));
    }

    #[test]
    fn register_with_runs_callback_only_on_success() {
        let registry = ExecutionRegistry::new(10);
        let mut calls = 0;
        registry
            .register_with("a", StopFlag::new(), handle(), || calls += 1)
            .unwrap();
        assert_eq!(calls, 1);

        let err = registry.register_with("a", StopFlag::new(), handle(), || calls += 1);
        assert!(err.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn settled_ids_can_be_reused_and_stale_runs_are_ignored() {
        let registry = ExecutionRegistry::new(10);
        let first = registry.register("a", StopFlag::new(), handle()).unwrap();
        registry.finish("a", first, ExecutionStatus::Failed).unwrap();

        let second = registry.register("a", StopFlag::new(), handle()).unwrap();
        assert_ne!(first, second);
        assert_eq!(registry.terminal_count(), 0);
        assert_eq!(registry.status("a"), Some(ExecutionStatus::Running));

        assert!(registry.finish("a", first, ExecutionStatus::Cancelled).is_none());
        assert_eq!(registry.status("a"), Some(ExecutionStatus::Running));
    }

    #[test]
    fn retention_evicts_oldest_terminal_records_only() {
        let registry = ExecutionRegistry::new(3);
        let live = registry.register("live", StopFlag::new(), handle()).unwrap();

        for i in 0..5 {
            let id = format!("done-{}", i);
            let seq = registry.register(&id, StopFlag::new(), handle()).unwrap();
            registry.finish(&id, seq, ExecutionStatus::Completed);
        }

        assert_eq!(registry.terminal_count(), 3);
        assert!(registry.get("done-0").is_none());
        assert!(registry.get("done-1").is_none());
        assert!(registry.get("done-4").is_some());
        assert_eq!(registry.status("live"), Some(ExecutionStatus::Running));
        assert_eq!(registry.active().len(), 1);

        registry.finish("live", live, ExecutionStatus::Completed);
        assert_eq!(registry.terminal_count(), 3);
        assert!(registry.get("done-2").is_none());
        assert!(registry.get("live").is_some());
    }

    #[test]
    fn info_reports_duration_once_terminal() {
        let registry = ExecutionRegistry::new(10);
        let seq = registry.register("a", StopFlag::new(), handle()).unwrap();
        assert_eq!(registry.get("a").unwrap().duration_ms, None);

        registry.finish("a", seq, ExecutionStatus::Timeout);
        let info = registry.get("a").unwrap();
        assert_eq!(info.status, ExecutionStatus::Timeout);
        assert!(info.finished_at.is_some());
        assert!(info.duration_ms.is_some());
    }
}
