//! Task runtime.
//!
//! Core components:
//! - `task` — task ids, work units (`Sync` / `Async`), execution context
//! - `state` — task state machine (Pending → Running → Completed/Failed/Cancelled)
//! - `registry` — single-writer task table
//! - `pool` — bounded worker pool for background work
//! - `scheduler` — the loop that owns the registry and drains the hand-off channel
//! - `runtime` — cloneable handle plus the completion notifier interface

pub mod pool;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod task;

pub use pool::PoolStatus;
pub use registry::TaskSummary;
pub use runtime::{CompletionNotifier, TaskRuntime};
pub use scheduler::WorkerMessage;
pub use state::TaskStatus;
pub use task::{ExecutionMode, TaskContext, TaskId, TaskOutcome, TaskSnapshot, Work, WorkResult};
