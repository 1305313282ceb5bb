//! Execution runtime for crew runs
//!
//! Runs blocking units of work on a bounded pool of OS threads, tracks each
//! execution through its lifecycle, and supports cooperative cancellation and
//! timeouts. One `ExecutionManager` is built at startup, shared by `Arc`, and
//! shut down explicitly at process exit.

mod cancellation;
mod config;
mod error;
mod manager;
mod metrics;
mod pool;
mod registry;

pub use cancellation::CancellationController;
pub use config::RuntimeConfig;
pub use error::RuntimeError;
pub use manager::{ExecutionManager, Submission};
pub use metrics::MetricsAggregator;
pub use pool::{CancelHandle, PreparedTask, Task, TaskOutcome, WorkerPool};
pub use registry::ExecutionRegistry;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// None of the runtime's critical sections leave state half-updated, so the
/// inner value is still consistent after a poisoning panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
