//! Task scheduler loop.
//!
//! One tokio task owns the [`TaskRegistry`] and is the only code that mutates
//! it. Callers reach it through [`Command`]s sent by the runtime handle; worker
//! threads and foreground tasks reach it through [`WorkerMessage`]s on the
//! hand-off channel. Both channels are drained by a single `select!` loop.
//!
//! Notifier calls leave the loop through one more channel, drained in order
//! by a single forwarding task, so an owner always sees a task's submission
//! before its outcome.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::error::{RuntimeError, TaskError};
use crate::worker::pool::{WorkerPool, flatten_join, panic_message};
use crate::worker::registry::{TaskRegistry, TaskSummary};
use crate::worker::runtime::CompletionNotifier;
use crate::worker::state::TaskStatus;
use crate::worker::task::{
    ExecutionMode, TaskContext, TaskId, TaskOutcome, TaskSnapshot, Work, WorkResult,
};

/// Posted by running work back to the scheduler.
#[derive(Debug)]
pub enum WorkerMessage {
    Started { id: TaskId },
    Progress { id: TaskId, value: f64 },
    Finished { id: TaskId, result: WorkResult },
}

/// Lifecycle event queued for the completion notifier.
enum Notification {
    Submitted {
        owner: String,
        id: TaskId,
    },
    Finished {
        owner: String,
        id: TaskId,
        outcome: TaskOutcome,
    },
}

/// Requests from the runtime handle.
pub(crate) enum Command {
    Submit {
        name: String,
        work: Work,
        mode: ExecutionMode,
        owner: String,
        reply: oneshot::Sender<Result<TaskId, RuntimeError>>,
    },
    Cancel {
        id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    Status {
        id: TaskId,
        reply: oneshot::Sender<Option<TaskSnapshot>>,
    },
    List {
        status: Option<TaskStatus>,
        limit: usize,
        reply: oneshot::Sender<Vec<TaskSnapshot>>,
    },
    Stats {
        reply: oneshot::Sender<TaskSummary>,
    },
    CleanupOld {
        max_age: Duration,
        reply: oneshot::Sender<usize>,
    },
    SetNotifier(Arc<dyn CompletionNotifier>),
    Shutdown {
        wait: bool,
        reply: oneshot::Sender<()>,
    },
}

pub(crate) struct Scheduler {
    registry: TaskRegistry,
    pool: WorkerPool,
    foreground: HashMap<TaskId, AbortHandle>,
    notifications: Option<mpsc::UnboundedSender<Notification>>,
    worker_tx: mpsc::UnboundedSender<WorkerMessage>,
    shut_down: bool,
}

impl Scheduler {
    pub(crate) fn new(pool: WorkerPool, worker_tx: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self {
            registry: TaskRegistry::new(),
            pool,
            foreground: HashMap::new(),
            notifications: None,
            worker_tx,
            shut_down: false,
        }
    }

    /// Run until every runtime handle has been dropped.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut messages: mpsc::UnboundedReceiver<WorkerMessage>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(message) = messages.recv() => self.handle_message(message),
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }
        tracing::debug!("Scheduler loop exited");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit {
                name,
                work,
                mode,
                owner,
                reply,
            } => {
                let _ = reply.send(self.submit(name, work, mode, owner));
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id));
            }
            Command::Status { id, reply } => {
                let _ = reply.send(self.registry.snapshot(id));
            }
            Command::List {
                status,
                limit,
                reply,
            } => {
                let _ = reply.send(self.registry.list(status, limit));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.registry.summary());
            }
            Command::CleanupOld { max_age, reply } => {
                let removed = self.registry.cleanup_old(max_age);
                if removed > 0 {
                    tracing::info!(removed, "Cleaned up old tasks");
                }
                let _ = reply.send(removed);
            }
            Command::SetNotifier(notifier) => {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(forward_notifications(notifier, rx));
                // The previous forwarder drains what it already holds, then exits.
                self.notifications = Some(tx);
            }
            Command::Shutdown { wait, reply } => self.shutdown(wait, reply),
        }
    }

    fn handle_message(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Started { id } => {
                if self.registry.mark_running(id) {
                    tracing::debug!(task_id = %id, "Task running");
                } else {
                    tracing::debug!(task_id = %id, "Ignoring start of inactive task");
                }
            }
            WorkerMessage::Progress { id, value } => {
                self.registry.update_progress(id, value);
            }
            WorkerMessage::Finished { id, result } => {
                self.foreground.remove(&id);
                match self.registry.finish(id, result) {
                    Some(outcome) => {
                        if outcome.success {
                            tracing::info!(task_id = %id, name = %outcome.name, "Task completed");
                        } else {
                            tracing::warn!(
                                task_id = %id,
                                name = %outcome.name,
                                status = %outcome.status,
                                error = outcome.error.as_deref().unwrap_or_default(),
                                "Task did not complete"
                            );
                        }
                        self.notify(id, outcome);
                    }
                    None => {
                        tracing::debug!(task_id = %id, "Ignoring late completion");
                    }
                }
            }
        }
    }

    fn submit(
        &mut self,
        name: String,
        work: Work,
        mode: ExecutionMode,
        owner: String,
    ) -> Result<TaskId, RuntimeError> {
        if self.shut_down {
            return Err(RuntimeError::ShutDown);
        }

        let (id, cancelled) = self.registry.create(name.clone(), mode, owner.clone());
        tracing::info!(
            task_id = %id,
            name = %name,
            mode = %mode,
            kind = work.kind(),
            owner = %owner,
            "Task submitted"
        );

        self.post(Notification::Submitted { owner, id });

        let ctx = TaskContext::new(id, self.worker_tx.clone(), cancelled);
        match mode {
            ExecutionMode::Background => {
                self.pool.dispatch(id, work, ctx, self.worker_tx.clone());
            }
            ExecutionMode::Foreground => self.spawn_foreground(id, work, ctx),
        }
        Ok(id)
    }

    fn spawn_foreground(&mut self, id: TaskId, work: Work, ctx: TaskContext) {
        let tx = self.worker_tx.clone();
        let handle = tokio::spawn(async move {
            let _ = tx.send(WorkerMessage::Started { id });
            let result = run_foreground(work, ctx).await;
            let _ = tx.send(WorkerMessage::Finished { id, result });
        });
        self.foreground.insert(id, handle.abort_handle());
    }

    fn cancel(&mut self, id: TaskId) -> bool {
        let Some(outcome) = self.registry.cancel(id) else {
            return false;
        };

        // Background work is flagged only; a running thread finishes on its own.
        if let Some(handle) = self.foreground.remove(&id) {
            handle.abort();
        }
        tracing::info!(task_id = %id, name = %outcome.name, "Task cancelled");
        self.notify(id, outcome);
        true
    }

    fn shutdown(&mut self, wait: bool, reply: oneshot::Sender<()>) {
        self.shut_down = true;

        let active = self.registry.active_ids();
        let cancelled = active.len();
        for id in active {
            self.cancel(id);
        }
        tracing::info!(cancelled, wait, "Task runtime shutting down");

        if wait {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                pool.drain().await;
                let _ = reply.send(());
            });
        } else {
            self.pool.close();
            let _ = reply.send(());
        }
    }

    /// Hand a terminal outcome to the notifier. Called once per terminal transition.
    fn notify(&self, id: TaskId, outcome: TaskOutcome) {
        let owner = self.registry.owner(id).unwrap_or_default().to_string();
        self.post(Notification::Finished { owner, id, outcome });
    }

    fn post(&self, notification: Notification) {
        if let Some(tx) = &self.notifications {
            let _ = tx.send(notification);
        }
    }
}

async fn forward_notifications(
    notifier: Arc<dyn CompletionNotifier>,
    mut events: mpsc::UnboundedReceiver<Notification>,
) {
    while let Some(event) = events.recv().await {
        match event {
            Notification::Submitted { owner, id } => notifier.task_submitted(&owner, id).await,
            Notification::Finished { owner, id, outcome } => {
                notifier.notify(&owner, id, outcome).await
            }
        }
    }
}

async fn run_foreground(work: Work, ctx: TaskContext) -> WorkResult {
    match work {
        Work::Async(f) => AssertUnwindSafe(async move { f(ctx).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(TaskError::Panicked(panic_message(&*payload)))),
        Work::Sync(f) => flatten_join(tokio::task::spawn_blocking(move || f(ctx)).await),
    }
}
