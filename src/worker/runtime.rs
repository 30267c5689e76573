//! Task runtime handle.
//!
//! [`TaskRuntime`] is a cheap `Clone` handle onto the scheduler loop. It is
//! constructed explicitly by the binary and injected wherever tasks are
//! submitted or inspected.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::worker::pool::{PoolStatus, WorkerPool};
use crate::worker::registry::TaskSummary;
use crate::worker::scheduler::{Command, Scheduler, WorkerMessage};
use crate::worker::state::TaskStatus;
use crate::worker::task::{ExecutionMode, TaskId, TaskOutcome, TaskSnapshot, Work};

/// Shortest poll period `wait` accepts.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Receives task lifecycle events for delivery to the owning identity.
#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    /// Called exactly once when a task reaches a terminal status.
    async fn notify(&self, owner: &str, task_id: TaskId, outcome: TaskOutcome);

    /// Called when a task is registered.
    async fn task_submitted(&self, _owner: &str, _task_id: TaskId) {}
}

/// Handle for submitting and inspecting tasks.
#[derive(Clone)]
pub struct TaskRuntime {
    commands: mpsc::UnboundedSender<Command>,
    worker_tx: mpsc::UnboundedSender<WorkerMessage>,
    pool: WorkerPool,
    config: RuntimeConfig,
}

impl TaskRuntime {
    /// Spawn the scheduler loop on the current tokio runtime.
    pub fn start(mut config: RuntimeConfig) -> Self {
        config.poll_interval = config.poll_interval.max(MIN_POLL_INTERVAL);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();

        let pool = WorkerPool::new(config.max_workers);
        tracing::info!(max_workers = pool.size(), "Starting task runtime");
        let scheduler = Scheduler::new(pool.clone(), worker_tx.clone());
        tokio::spawn(scheduler.run(command_rx, worker_rx));

        Self {
            commands,
            worker_tx,
            pool,
            config,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Occupancy of the background worker pool.
    pub fn workers(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Register the completion notifier. Replaces any earlier one.
    pub fn set_notifier(&self, notifier: Arc<dyn CompletionNotifier>) {
        let _ = self.commands.send(Command::SetNotifier(notifier));
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| RuntimeError::ShutDown)?;
        rx.await.map_err(|_| RuntimeError::ShutDown)
    }

    /// Register a task in `pending` and schedule it.
    pub async fn submit(
        &self,
        name: impl Into<String>,
        work: Work,
        mode: ExecutionMode,
        owner: impl Into<String>,
    ) -> Result<TaskId, RuntimeError> {
        let name = name.into();
        let owner = owner.into();
        self.request(|reply| Command::Submit {
            name,
            work,
            mode,
            owner,
            reply,
        })
        .await?
    }

    /// Cancel a task. `false` if it is unknown or already terminal.
    pub async fn cancel(&self, id: TaskId) -> bool {
        self.request(|reply| Command::Cancel { id, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn get_status(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.request(|reply| Command::Status { id, reply })
            .await
            .ok()
            .flatten()
    }

    /// Record progress for a task. Clamped to `[0, 1]`; ignored for unknown
    /// or terminal tasks.
    pub fn update_progress(&self, id: TaskId, value: f64) {
        let _ = self.worker_tx.send(WorkerMessage::Progress { id, value });
    }

    /// Snapshots, newest first.
    pub async fn list(&self, status: Option<TaskStatus>, limit: usize) -> Vec<TaskSnapshot> {
        self.request(|reply| Command::List {
            status,
            limit,
            reply,
        })
        .await
        .unwrap_or_default()
    }

    pub async fn stats(&self) -> TaskSummary {
        self.request(|reply| Command::Stats { reply })
            .await
            .unwrap_or_default()
    }

    /// Remove terminal tasks older than `max_age`. Returns the count removed.
    pub async fn cleanup_old(&self, max_age: Duration) -> usize {
        self.request(|reply| Command::CleanupOld { max_age, reply })
            .await
            .unwrap_or(0)
    }

    /// Poll until the task is terminal or `timeout` elapses.
    ///
    /// On timeout the task is cancelled and `Timeout` is returned. A failed
    /// task yields `TaskFailed`, a cancelled one `Cancelled`.
    pub async fn wait(&self, id: TaskId, timeout: Duration) -> Result<serde_json::Value, RuntimeError> {
        let deadline = Instant::now() + timeout;
        let mut interval = tokio::time::interval(self.config.poll_interval);

        loop {
            let snapshot = self
                .get_status(id)
                .await
                .ok_or(RuntimeError::NotFound { id })?;
            if let Some(outcome) = settled(id, snapshot) {
                return outcome;
            }

            if Instant::now() >= deadline {
                return self.expire(id, timeout).await;
            }

            tokio::select! {
                _ = interval.tick() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Cancel a task whose wait ran out. A task that finished after the last
    /// poll reports its own outcome instead.
    async fn expire(&self, id: TaskId, timeout: Duration) -> Result<serde_json::Value, RuntimeError> {
        if self.cancel(id).await {
            tracing::warn!(task_id = %id, timeout_ms = timeout.as_millis() as u64, "Wait timed out, task cancelled");
            return Err(RuntimeError::Timeout { id, timeout });
        }
        let snapshot = self
            .get_status(id)
            .await
            .ok_or(RuntimeError::NotFound { id })?;
        settled(id, snapshot).unwrap_or(Err(RuntimeError::Timeout { id, timeout }))
    }

    /// Cancel every non-terminal task and stop accepting submissions. With
    /// `wait`, returns only after running pool work has drained.
    pub async fn shutdown(&self, wait: bool) {
        let _ = self.request(|reply| Command::Shutdown { wait, reply }).await;
    }
}

/// What `wait` returns for a terminal snapshot; `None` while still active.
fn settled(id: TaskId, snapshot: TaskSnapshot) -> Option<Result<serde_json::Value, RuntimeError>> {
    match snapshot.status {
        TaskStatus::Completed => Some(Ok(snapshot.result.unwrap_or(serde_json::Value::Null))),
        TaskStatus::Failed => Some(Err(RuntimeError::TaskFailed {
            id,
            reason: snapshot.error.unwrap_or_default(),
        })),
        TaskStatus::Cancelled => Some(Err(RuntimeError::Cancelled { id })),
        TaskStatus::Pending | TaskStatus::Running => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use serde_json::json;

    use super::*;
    use crate::error::TaskError;

    fn runtime() -> TaskRuntime {
        TaskRuntime::start(RuntimeConfig {
            max_workers: 2,
            poll_interval: Duration::from_millis(10),
        })
    }

    fn countdown(millis: u64) -> Work {
        Work::blocking(move |ctx| {
            for step in 1..=4 {
                std::thread::sleep(Duration::from_millis(millis / 4));
                ctx.report_progress(step as f64 / 4.0);
            }
            Ok(json!({ "message": "done", "millis": millis }))
        })
    }

    async fn explode() -> crate::worker::task::WorkResult {
        panic!("kaboom")
    }

    #[derive(Default)]
    struct RecordingNotifier {
        completions: Mutex<Vec<(String, TaskId, TaskOutcome)>>,
        submitted: Mutex<Vec<TaskId>>,
    }

    #[async_trait]
    impl CompletionNotifier for RecordingNotifier {
        async fn notify(&self, owner: &str, task_id: TaskId, outcome: TaskOutcome) {
            self.completions
                .lock()
                .unwrap()
                .push((owner.to_string(), task_id, outcome));
        }

        async fn task_submitted(&self, _owner: &str, task_id: TaskId) {
            self.submitted.lock().unwrap().push(task_id);
        }
    }

    #[tokio::test]
    async fn background_countdown_completes() {
        let rt = runtime();
        let id = rt
            .submit("countdown", countdown(120), ExecutionMode::Background, "userA")
            .await
            .unwrap();

        let early = rt.get_status(id).await.unwrap();
        assert!(matches!(early.status, TaskStatus::Pending | TaskStatus::Running));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let done = rt.get_status(id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result.unwrap()["millis"], 120);
        assert_eq!(done.progress, 1.0);
        assert!(done.started_at.is_some());
    }

    #[tokio::test]
    async fn foreground_async_wait_returns_result() {
        let rt = runtime();
        let work = Work::future(|_| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(json!(42))
        });
        let id = rt
            .submit("answer", work, ExecutionMode::Foreground, "u")
            .await
            .unwrap();
        assert_eq!(rt.wait(id, Duration::from_secs(1)).await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn cancel_completed_false_running_true() {
        let rt = runtime();
        let quick = rt
            .submit("quick", Work::blocking(|_| Ok(json!(1))), ExecutionMode::Background, "u")
            .await
            .unwrap();
        rt.wait(quick, Duration::from_secs(1)).await.unwrap();
        assert!(!rt.cancel(quick).await);

        let slow = Work::future(|_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!(2))
        });
        let id = rt.submit("slow", slow, ExecutionMode::Foreground, "u").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(rt.get_status(id).await.unwrap().status, TaskStatus::Running);

        assert!(rt.cancel(id).await);
        assert_eq!(rt.get_status(id).await.unwrap().status, TaskStatus::Cancelled);
        assert!(!rt.cancel(id).await);
    }

    #[tokio::test]
    async fn wait_timeout_cancels_task() {
        let rt = runtime();
        let id = rt
            .submit("slow", countdown(400), ExecutionMode::Background, "u")
            .await
            .unwrap();

        let err = rt.wait(id, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout { .. }));
        assert_eq!(rt.get_status(id).await.unwrap().status, TaskStatus::Cancelled);

        // The worker thread finishing later must not revive the task.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(rt.get_status(id).await.unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn failures_and_panics_are_captured() {
        let rt = runtime();
        let failing = rt
            .submit(
                "failing",
                Work::blocking(|_| Err(TaskError::failed("no such file"))),
                ExecutionMode::Background,
                "u",
            )
            .await
            .unwrap();
        match rt.wait(failing, Duration::from_secs(1)).await {
            Err(RuntimeError::TaskFailed { reason, .. }) => assert_eq!(reason, "no such file"),
            other => panic!("unexpected: {other:?}"),
        }

        let panicking = rt
            .submit(
                "panicking",
                Work::future(|_| explode()),
                ExecutionMode::Foreground,
                "u",
            )
            .await
            .unwrap();
        assert!(matches!(
            rt.wait(panicking, Duration::from_secs(1)).await,
            Err(RuntimeError::TaskFailed { .. })
        ));
        let snapshot = rt.get_status(panicking).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert!(snapshot.error.unwrap().contains("kaboom"));
    }

    #[tokio::test]
    async fn progress_is_clamped() {
        let rt = runtime();
        let work = Work::future(|_| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(json!(null))
        });
        let id = rt.submit("p", work, ExecutionMode::Foreground, "u").await.unwrap();

        rt.update_progress(id, 2.5);
        assert_eq!(rt.get_status(id).await.unwrap().progress, 1.0);
        rt.update_progress(id, -1.0);
        assert_eq!(rt.get_status(id).await.unwrap().progress, 0.0);
        rt.update_progress(TaskId(999), 0.5);
        rt.cancel(id).await;
    }

    #[tokio::test]
    async fn notifier_receives_each_terminal_transition_once() {
        let rt = runtime();
        let notifier = Arc::new(RecordingNotifier::default());
        rt.set_notifier(notifier.clone());

        let ok = rt
            .submit("ok", Work::blocking(|_| Ok(json!("hi"))), ExecutionMode::Background, "userA")
            .await
            .unwrap();
        rt.wait(ok, Duration::from_secs(1)).await.unwrap();

        let slow = Work::future(|_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!(null))
        });
        let cancelled = rt.submit("slow", slow, ExecutionMode::Foreground, "userB").await.unwrap();
        rt.cancel(cancelled).await;
        rt.cancel(cancelled).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let completions = notifier.completions.lock().unwrap().clone();
        assert_eq!(completions.len(), 2);
        assert_eq!(completions[0].0, "userA");
        assert_eq!(completions[0].1, ok);
        assert!(completions[0].2.success);
        assert_eq!(completions[1].0, "userB");
        assert_eq!(completions[1].2.status, TaskStatus::Cancelled);
        assert_eq!(notifier.submitted.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn observed_statuses_follow_lifecycle() {
        let rt = runtime();
        let id = rt
            .submit("countdown", countdown(80), ExecutionMode::Background, "u")
            .await
            .unwrap();

        let mut seen: Vec<TaskStatus> = Vec::new();
        for _ in 0..30 {
            let status = rt.get_status(id).await.unwrap().status;
            if seen.last() != Some(&status) {
                seen.push(status);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let order = |s: &TaskStatus| match s {
            TaskStatus::Pending => 0,
            TaskStatus::Running => 1,
            _ => 2,
        };
        assert!(seen.windows(2).all(|w| order(&w[0]) < order(&w[1])));
        assert!(seen.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn shutdown_cancels_and_rejects() {
        let rt = runtime();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);

        let running = rt.submit("a", countdown(80), ExecutionMode::Background, "u").await.unwrap();
        let _second = rt.submit("b", countdown(80), ExecutionMode::Background, "u").await.unwrap();
        let queued = rt
            .submit(
                "c",
                Work::blocking(move |_| {
                    ran_clone.store(true, Ordering::SeqCst);
                    Ok(json!(null))
                }),
                ExecutionMode::Background,
                "u",
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        rt.shutdown(true).await;
        assert_eq!(rt.get_status(running).await.unwrap().status, TaskStatus::Cancelled);
        assert_eq!(rt.get_status(queued).await.unwrap().status, TaskStatus::Cancelled);
        assert!(!ran.load(Ordering::SeqCst));

        let err = rt
            .submit("late", Work::blocking(|_| Ok(json!(null))), ExecutionMode::Background, "u")
            .await
            .unwrap_err();
        assert_eq!(err, RuntimeError::ShutDown);
    }

    #[tokio::test]
    async fn list_stats_and_cleanup() {
        let rt = runtime();
        for n in 0..3 {
            let id = rt
                .submit(format!("t{n}"), Work::blocking(move |_| Ok(json!(n))), ExecutionMode::Background, "u")
                .await
                .unwrap();
            rt.wait(id, Duration::from_secs(1)).await.unwrap();
        }

        let listed = rt.list(None, 10).await;
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].name, "t2");
        assert_eq!(rt.list(Some(TaskStatus::Failed), 10).await.len(), 0);

        let stats = rt.stats().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 3);

        assert_eq!(rt.cleanup_old(Duration::ZERO).await, 3);
        assert_eq!(rt.stats().await.total, 0);
    }

    #[tokio::test]
    async fn zero_poll_interval_is_clamped() {
        let rt = TaskRuntime::start(RuntimeConfig {
            max_workers: 1,
            poll_interval: Duration::ZERO,
        });
        assert_eq!(rt.config().poll_interval, MIN_POLL_INTERVAL);

        let work = Work::future(|_| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(json!("done"))
        });
        let id = rt.submit("tick", work, ExecutionMode::Foreground, "u").await.unwrap();
        assert_eq!(rt.wait(id, Duration::from_secs(1)).await.unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn finished_at_deadline_reports_outcome_not_timeout() {
        let rt = runtime();
        let id = rt
            .submit("quick", Work::blocking(|_| Ok(json!(7))), ExecutionMode::Background, "u")
            .await
            .unwrap();
        rt.wait(id, Duration::from_secs(1)).await.unwrap();

        // The cancel issued at the deadline loses the race to completion.
        assert_eq!(rt.expire(id, Duration::from_millis(1)).await.unwrap(), json!(7));
        assert_eq!(rt.get_status(id).await.unwrap().status, TaskStatus::Completed);

        let failing = rt
            .submit(
                "failing",
                Work::blocking(|_| Err(TaskError::failed("gone"))),
                ExecutionMode::Background,
                "u",
            )
            .await
            .unwrap();
        let _ = rt.wait(failing, Duration::from_secs(1)).await;
        assert!(matches!(
            rt.expire(failing, Duration::from_millis(1)).await,
            Err(RuntimeError::TaskFailed { .. })
        ));
    }

    #[tokio::test]
    async fn worker_pool_status() {
        let rt = runtime();
        let status = rt.workers();
        assert_eq!(status.size, 2);
        assert_eq!(status.available, 2);
        assert!(!status.closed);

        rt.shutdown(false).await;
        assert!(rt.workers().closed);
    }

    #[tokio::test]
    async fn unknown_task() {
        let rt = runtime();
        assert!(rt.get_status(TaskId(77)).await.is_none());
        assert!(!rt.cancel(TaskId(77)).await);
        assert_eq!(
            rt.wait(TaskId(77), Duration::from_millis(10)).await.unwrap_err(),
            RuntimeError::NotFound { id: TaskId(77) }
        );
    }
}
