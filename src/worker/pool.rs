//! Bounded worker pool for background work.
//!
//! A semaphore caps how many work units occupy a blocking thread at once.
//! Queued units wait for a permit in submission order. Workers never touch the
//! registry: they post `Started` / `Finished` on the hand-off channel.

use std::any::Any;
use std::sync::Arc;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinError;

use crate::error::TaskError;
use crate::worker::scheduler::WorkerMessage;
use crate::worker::task::{TaskContext, TaskId, Work, WorkResult};

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub size: usize,
    pub available: usize,
    pub closed: bool,
}

/// Fixed-size pool of blocking threads.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of free worker slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            size: self.size,
            available: self.available(),
            closed: self.is_closed(),
        }
    }

    /// Queue `work` for execution on the pool.
    pub(crate) fn dispatch(
        &self,
        id: TaskId,
        work: Work,
        ctx: TaskContext,
        tx: mpsc::UnboundedSender<WorkerMessage>,
    ) {
        let semaphore = Arc::clone(&self.semaphore);
        let handle = Handle::current();

        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                let _ = tx.send(WorkerMessage::Finished {
                    id,
                    result: Err(TaskError::failed("worker pool is shut down")),
                });
                return;
            };

            if ctx.is_cancelled() {
                tracing::debug!(task_id = %id, "Skipping cancelled task");
                return;
            }

            let _ = tx.send(WorkerMessage::Started { id });
            tracing::debug!(task_id = %id, kind = work.kind(), "Worker picked up task");

            let joined = tokio::task::spawn_blocking(move || run_blocking(work, ctx, handle)).await;
            let result = flatten_join(joined);

            let _ = tx.send(WorkerMessage::Finished { id, result });
        });
    }

    /// Wait for every queued and running unit to release its slot, then close
    /// the pool so later dispatches fail fast.
    pub async fn drain(&self) {
        let permits = u32::try_from(self.size).unwrap_or(u32::MAX);
        if let Ok(all) = self.semaphore.acquire_many(permits).await {
            all.forget();
        }
        self.semaphore.close();
    }

    /// Close without waiting. Running units finish on their own thread.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

fn run_blocking(work: Work, ctx: TaskContext, handle: Handle) -> WorkResult {
    match work {
        Work::Sync(f) => f(ctx),
        Work::Async(f) => handle.block_on(f(ctx)),
    }
}

/// Map a blocking-thread join into the work result, turning panics into
/// `TaskError::Panicked`.
pub(crate) fn flatten_join(joined: Result<WorkResult, JoinError>) -> WorkResult {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(TaskError::Panicked(panic_message(&*e.into_panic()))),
        Err(e) => Err(TaskError::failed(e.to_string())),
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn context(id: TaskId, tx: &mpsc::UnboundedSender<WorkerMessage>) -> (TaskContext, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        (TaskContext::new(id, tx.clone(), Arc::clone(&flag)), flag)
    }

    async fn next_finished(rx: &mut mpsc::UnboundedReceiver<WorkerMessage>) -> (TaskId, WorkResult) {
        loop {
            match rx.recv().await {
                Some(WorkerMessage::Finished { id, result }) => return (id, result),
                Some(_) => continue,
                None => panic!("channel closed"),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_sync_and_async_work() {
        let pool = WorkerPool::new(2);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let (ctx, _) = context(TaskId(1), &tx);
        pool.dispatch(TaskId(1), Work::blocking(|_| Ok(json!("sync"))), ctx, tx.clone());
        let (id, result) = next_finished(&mut rx).await;
        assert_eq!(id, TaskId(1));
        assert_eq!(result.unwrap(), json!("sync"));

        let (ctx, _) = context(TaskId(2), &tx);
        let work = Work::future(|_| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(json!("async"))
        });
        pool.dispatch(TaskId(2), work, ctx, tx.clone());
        let (_, result) = next_finished(&mut rx).await;
        assert_eq!(result.unwrap(), json!("async"));
    }

    #[tokio::test]
    async fn sends_started_before_finished() {
        let pool = WorkerPool::new(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (ctx, _) = context(TaskId(1), &tx);
        pool.dispatch(TaskId(1), Work::blocking(|_| Ok(json!(null))), ctx, tx.clone());

        assert!(matches!(rx.recv().await, Some(WorkerMessage::Started { id }) if id == TaskId(1)));
        assert!(matches!(rx.recv().await, Some(WorkerMessage::Finished { .. })));
    }

    #[tokio::test]
    async fn panic_is_captured() {
        let pool = WorkerPool::new(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (ctx, _) = context(TaskId(1), &tx);
        pool.dispatch(TaskId(1), Work::blocking(|_| panic!("boom")), ctx, tx.clone());

        let (_, result) = next_finished(&mut rx).await;
        assert_eq!(result.unwrap_err(), TaskError::Panicked("boom".into()));
    }

    #[tokio::test]
    async fn bounded_concurrency() {
        let pool = WorkerPool::new(2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for n in 1..=6 {
            let (ctx, _) = context(TaskId(n), &tx);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let work = Work::blocking(move |_| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(30));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(n))
            });
            pool.dispatch(TaskId(n), work, ctx, tx.clone());
        }

        for _ in 0..6 {
            next_finished(&mut rx).await;
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn queued_cancelled_work_is_skipped() {
        let pool = WorkerPool::new(1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let (ctx, _) = context(TaskId(1), &tx);
        pool.dispatch(
            TaskId(1),
            Work::blocking(|_| {
                std::thread::sleep(Duration::from_millis(50));
                Ok(json!(1))
            }),
            ctx,
            tx.clone(),
        );

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        let (ctx, flag) = context(TaskId(2), &tx);
        pool.dispatch(
            TaskId(2),
            Work::blocking(move |_| {
                ran_clone.store(true, Ordering::SeqCst);
                Ok(json!(2))
            }),
            ctx,
            tx.clone(),
        );
        flag.store(true, Ordering::SeqCst);

        let (id, _) = next_finished(&mut rx).await;
        assert_eq!(id, TaskId(1));
        pool.drain().await;
        assert!(!ran.load(Ordering::SeqCst));
        assert!(pool.is_closed());
    }

    #[tokio::test]
    async fn closed_pool_reports_failure() {
        let pool = WorkerPool::new(1);
        pool.close();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (ctx, _) = context(TaskId(1), &tx);
        pool.dispatch(TaskId(1), Work::blocking(|_| Ok(json!(1))), ctx, tx.clone());

        let (_, result) = next_finished(&mut rx).await;
        assert!(result.is_err());
    }
}
