//! Task registry.
//!
//! Plain single-writer structure: only the scheduler loop owns and mutates
//! it, so there is no lock here. Worker threads reach it exclusively through
//! the scheduler's hand-off channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::error::TaskError;
use crate::worker::state::TaskStatus;
use crate::worker::task::{ExecutionMode, TaskId, TaskOutcome, TaskSnapshot, WorkResult};

/// A registered task plus its cooperative cancellation flag.
#[derive(Debug)]
pub(crate) struct TaskRecord {
    pub(crate) task: TaskSnapshot,
    pub(crate) cancelled: Arc<AtomicBool>,
}

impl TaskRecord {
    fn transition_to(&mut self, status: TaskStatus) -> Result<(), String> {
        if !self.task.status.can_transition_to(status) {
            return Err(format!(
                "Cannot transition {} from {} to {}",
                self.task.task_id, self.task.status, status
            ));
        }

        self.task.status = status;
        match status {
            TaskStatus::Running if self.task.started_at.is_none() => {
                self.task.started_at = Some(Utc::now());
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.task.completed_at = Some(Utc::now());
                if status == TaskStatus::Cancelled {
                    self.cancelled.store(true, Ordering::Release);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Summary of all tasks.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Id allocation and per-task state.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<TaskId, TaskRecord>,
    last_id: u64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending task. Returns its id and cancellation flag.
    pub fn create(
        &mut self,
        name: impl Into<String>,
        mode: ExecutionMode,
        owner: impl Into<String>,
    ) -> (TaskId, Arc<AtomicBool>) {
        self.last_id += 1;
        let id = TaskId(self.last_id);
        let cancelled = Arc::new(AtomicBool::new(false));

        let task = TaskSnapshot {
            task_id: id,
            name: name.into(),
            status: TaskStatus::Pending,
            mode,
            owner: owner.into(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0.0,
            result: None,
            error: None,
        };
        self.tasks.insert(
            id,
            TaskRecord {
                task,
                cancelled: Arc::clone(&cancelled),
            },
        );
        (id, cancelled)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.tasks.get(&id).map(|r| r.task.status)
    }

    pub fn snapshot(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.tasks.get(&id).map(|r| r.task.clone())
    }

    pub fn owner(&self, id: TaskId) -> Option<&str> {
        self.tasks.get(&id).map(|r| r.task.owner.as_str())
    }

    /// Move a pending task to running. False if unknown or not pending.
    pub fn mark_running(&mut self, id: TaskId) -> bool {
        match self.tasks.get_mut(&id) {
            Some(record) if record.task.status == TaskStatus::Pending => {
                record.transition_to(TaskStatus::Running).is_ok()
            }
            _ => false,
        }
    }

    /// Record the work unit's result.
    ///
    /// Returns the outcome to notify, or `None` when the task is unknown or
    /// already terminal (e.g. cancelled while its thread kept running).
    pub fn finish(&mut self, id: TaskId, result: WorkResult) -> Option<TaskOutcome> {
        let record = self.tasks.get_mut(&id)?;
        if record.task.status.is_terminal() {
            return None;
        }

        let outcome = match result {
            Ok(value) => {
                record.transition_to(TaskStatus::Completed).ok()?;
                record.task.progress = 1.0;
                record.task.result = Some(value.clone());
                TaskOutcome::completed(&record.task.name, value)
            }
            Err(TaskError::Cancelled) => {
                record.transition_to(TaskStatus::Cancelled).ok()?;
                TaskOutcome::cancelled(&record.task.name)
            }
            Err(e) => {
                record.transition_to(TaskStatus::Failed).ok()?;
                let message = e.to_string();
                record.task.error = Some(message.clone());
                TaskOutcome::failed(&record.task.name, message)
            }
        };
        Some(outcome)
    }

    /// Mark a task cancelled. `None` if unknown or already terminal.
    pub fn cancel(&mut self, id: TaskId) -> Option<TaskOutcome> {
        let record = self.tasks.get_mut(&id)?;
        if record.task.status.is_terminal() {
            return None;
        }
        record.transition_to(TaskStatus::Cancelled).ok()?;
        Some(TaskOutcome::cancelled(&record.task.name))
    }

    /// Clamp and store progress. No-op for unknown or terminal tasks.
    pub fn update_progress(&mut self, id: TaskId, value: f64) {
        if let Some(record) = self.tasks.get_mut(&id)
            && record.task.status.is_active()
            && !value.is_nan()
        {
            record.task.progress = value.clamp(0.0, 1.0);
        }
    }

    /// Ids of all non-terminal tasks.
    pub fn active_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, r)| r.task.status.is_active())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Snapshots filtered by status, newest first.
    pub fn list(&self, status: Option<TaskStatus>, limit: usize) -> Vec<TaskSnapshot> {
        let mut tasks: Vec<TaskSnapshot> = self
            .tasks
            .values()
            .filter(|r| status.is_none_or(|s| r.task.status == s))
            .map(|r| r.task.clone())
            .collect();
        tasks.sort_by(|a, b| b.task_id.cmp(&a.task_id));
        tasks.truncate(limit);
        tasks
    }

    /// Remove terminal tasks created more than `max_age` ago.
    pub fn cleanup_old(&mut self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return 0;
        };
        let before = self.tasks.len();
        self.tasks
            .retain(|_, r| !(r.task.status.is_terminal() && r.task.created_at < cutoff));
        before - self.tasks.len()
    }

    pub fn summary(&self) -> TaskSummary {
        let mut summary = TaskSummary::default();
        for record in self.tasks.values() {
            match record.task.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::Running => summary.running += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
            }
        }
        summary.total = self.tasks.len();
        summary
    }
}
