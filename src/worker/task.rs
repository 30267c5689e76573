//! Task types: ids, work units, execution context and snapshots.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TaskError;
use crate::worker::scheduler::WorkerMessage;
use crate::worker::state::TaskStatus;

/// Process-scoped, monotonically increasing task id. Displays as `task_<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task_{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = String;

    /// Accepts both `task_7` and `7`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("task_").unwrap_or(s);
        digits
            .parse()
            .map(TaskId)
            .map_err(|_| format!("invalid task id: {s}"))
    }
}

impl TryFrom<String> for TaskId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.to_string()
    }
}

/// Where a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Directly on the async scheduler; may suspend at I/O.
    Foreground,
    /// On the bounded worker pool; runs to completion once started.
    Background,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Foreground => write!(f, "foreground"),
            Self::Background => write!(f, "background"),
        }
    }
}

/// Result produced by a work unit.
pub type WorkResult = Result<serde_json::Value, TaskError>;

/// Blocking work, arguments already bound.
pub type BlockingFn = Box<dyn FnOnce(TaskContext) -> WorkResult + Send + 'static>;

/// Suspendable work, arguments already bound.
pub type AsyncFn = Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, WorkResult> + Send + 'static>;

/// A unit of work, tagged at submission time.
pub enum Work {
    Sync(BlockingFn),
    Async(AsyncFn),
}

impl Work {
    /// Wrap a blocking closure.
    pub fn blocking<F>(f: F) -> Self
    where
        F: FnOnce(TaskContext) -> WorkResult + Send + 'static,
    {
        Self::Sync(Box::new(f))
    }

    /// Wrap an async closure.
    pub fn future<F, Fut>(f: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = WorkResult> + Send + 'static,
    {
        Self::Async(Box::new(move |ctx| f(ctx).boxed()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sync(_) => "sync",
            Self::Async(_) => "async",
        }
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Work::{}", self.kind())
    }
}

/// Handle given to a running work unit.
///
/// Progress reports go through the same hand-off channel as completions, so
/// worker threads never touch the registry. `is_cancelled()` is a cooperative
/// checkpoint: nothing interrupts work that ignores it.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: Option<TaskId>,
    tx: Option<mpsc::UnboundedSender<WorkerMessage>>,
    cancelled: Arc<AtomicBool>,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: TaskId,
        tx: mpsc::UnboundedSender<WorkerMessage>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            task_id: Some(task_id),
            tx: Some(tx),
            cancelled,
        }
    }

    /// A context not attached to any runtime task (inline foreground calls).
    pub fn detached() -> Self {
        Self {
            task_id: None,
            tx: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.task_id
    }

    /// Report progress in `[0, 1]`; values outside are clamped by the runtime.
    pub fn report_progress(&self, value: f64) {
        if let (Some(id), Some(tx)) = (self.task_id, &self.tx) {
            let _ = tx.send(WorkerMessage::Progress { id, value });
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Point-in-time view of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub mode: ExecutionMode,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: f64,
    /// Present only when completed.
    pub result: Option<serde_json::Value>,
    /// Present only when failed.
    pub error: Option<String>,
}

/// What the notifier receives when a task reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub name: String,
    pub status: TaskStatus,
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn completed(name: impl Into<String>, output: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            status: TaskStatus::Completed,
            success: true,
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: TaskStatus::Failed,
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn cancelled(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: TaskStatus::Cancelled,
            success: false,
            output: None,
            error: Some("cancelled".to_string()),
        }
    }
}
