//! Core types for the crew execution runtime
//!
//! This crate holds the vocabulary shared by the runtime and its callers:
//! execution statuses, snapshots, the stop flag handed to every unit of
//! work, lifecycle events and the error taxonomy. It has no threads of its own.

mod error;
pub mod events;
mod execution;
mod status;
mod stop;

pub use error::ExecutionError;
pub use events::{EventBus, ExecutionEvent};
pub use execution::{ExecutionId, ExecutionInfo, MetricsSnapshot};
pub use status::ExecutionStatus;
pub use stop::{Cancelled, StopFlag};
