//! Operation dispatch.
//!
//! Operations declare their capabilities once, at registration. The
//! dispatcher uses them to choose between submitting a background task and
//! running the call inline behind the operation's circuit breaker and the
//! retry policy.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Classify, DispatchError, IsolatorError, TaskError};
use crate::resilience::{BreakerRegistry, ErrorLedger, RetryPolicy, retry_with_backoff_if};
use crate::worker::runtime::TaskRuntime;
use crate::worker::task::{ExecutionMode, TaskContext, TaskId, Work};

/// What an operation supports, resolved at registration time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// May be submitted to the worker pool and delivered later.
    pub supports_background: bool,
    /// Calls `TaskContext::report_progress` while running.
    pub reports_progress: bool,
}

/// A named unit of functionality callers can invoke.
#[async_trait]
pub trait Operation: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn execute(&self, args: serde_json::Value, ctx: TaskContext) -> Result<serde_json::Value, TaskError>;
}

struct Registered {
    operation: Arc<dyn Operation>,
    capabilities: Capabilities,
}

/// Result of an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Invocation {
    /// Running in the background; the result is delivered to the owner.
    Submitted { task_id: TaskId },
    /// Ran inline.
    Completed { value: serde_json::Value },
}

/// Routes invocations to registered operations.
pub struct Dispatcher {
    operations: RwLock<HashMap<String, Registered>>,
    runtime: TaskRuntime,
    breakers: Arc<BreakerRegistry>,
    ledger: Arc<ErrorLedger>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        runtime: TaskRuntime,
        breakers: Arc<BreakerRegistry>,
        ledger: Arc<ErrorLedger>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            operations: RwLock::new(HashMap::new()),
            runtime,
            breakers,
            ledger,
            retry,
        }
    }

    pub fn runtime(&self) -> &TaskRuntime {
        &self.runtime
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn ledger(&self) -> &Arc<ErrorLedger> {
        &self.ledger
    }

    /// Register an operation. A later registration under the same name wins.
    pub async fn register(&self, operation: Arc<dyn Operation>) {
        let name = operation.name().to_string();
        let capabilities = operation.capabilities();
        debug!(
            operation = %name,
            background = capabilities.supports_background,
            progress = capabilities.reports_progress,
            "Registered operation"
        );
        self.operations.write().await.insert(
            name,
            Registered {
                operation,
                capabilities,
            },
        );
    }

    pub async fn capabilities(&self, name: &str) -> Option<Capabilities> {
        self.operations.read().await.get(name).map(|r| r.capabilities)
    }

    /// Registered operation names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operations.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Invoke `name` on behalf of `owner`.
    ///
    /// Background-capable operations asked to run in the background become
    /// tasks whose results go to `owner`. Everything else runs inline.
    pub async fn invoke(
        &self,
        name: &str,
        args: serde_json::Value,
        owner: &str,
        background: bool,
    ) -> Result<Invocation, DispatchError> {
        let (operation, capabilities) = {
            let operations = self.operations.read().await;
            let registered = operations
                .get(name)
                .ok_or_else(|| DispatchError::UnknownOperation {
                    name: name.to_string(),
                })?;
            (Arc::clone(&registered.operation), registered.capabilities)
        };

        if background && capabilities.supports_background {
            let work = Work::future(move |ctx| async move { operation.execute(args, ctx).await });
            let task_id = self
                .runtime
                .submit(name, work, ExecutionMode::Background, owner)
                .await?;
            info!(operation = %name, task_id = %task_id, owner = %owner, "Operation submitted");
            return Ok(Invocation::Submitted { task_id });
        }

        if background {
            debug!(operation = %name, "Operation cannot run in background, running inline");
        }

        let breaker = self.breakers.get(name).await;
        let context = serde_json::json!({ "operation": name, "owner": owner });
        let outcome = breaker
            .call(|| {
                retry_with_backoff_if(
                    &self.ledger,
                    &self.retry,
                    context,
                    || operation.execute(args.clone(), TaskContext::detached()),
                    TaskError::is_transient,
                )
            })
            .await;

        match outcome {
            Ok(value) => Ok(Invocation::Completed { value }),
            Err(IsolatorError::Open { retry_in, .. }) => {
                warn!(operation = %name, retry_in_ms = retry_in.as_millis() as u64, "Operation unavailable");
                Err(DispatchError::Unavailable {
                    name: name.to_string(),
                    retry_in,
                })
            }
            Err(IsolatorError::Inner(source)) => {
                let strategy = self.ledger.suggest_strategy(source.kind());
                if let Some(strategy) = strategy {
                    info!(operation = %name, kind = source.kind(), ?strategy, "Suggested recovery strategy");
                }
                Err(DispatchError::Failed {
                    name: name.to_string(),
                    source,
                    strategy,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::config::{IsolatorConfig, RuntimeConfig};
    use crate::resilience::RecoveryStrategy;
    use crate::worker::state::TaskStatus;

    struct Flaky {
        calls: AtomicU32,
        fail_first: u32,
        transient: bool,
    }

    #[async_trait]
    impl Operation for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn execute(&self, _args: serde_json::Value, _ctx: TaskContext) -> Result<serde_json::Value, TaskError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                if self.transient {
                    return Err(TaskError::transient("upstream timeout"));
                }
                return Err(TaskError::failed("bad request"));
            }
            Ok(json!({ "call": n }))
        }
    }

    struct Doubler;

    #[async_trait]
    impl Operation for Doubler {
        fn name(&self) -> &str {
            "double"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_background: true,
                reports_progress: false,
            }
        }

        async fn execute(&self, args: serde_json::Value, _ctx: TaskContext) -> Result<serde_json::Value, TaskError> {
            let n = args["n"].as_i64().ok_or_else(|| TaskError::failed("missing n"))?;
            Ok(json!(n * 2))
        }
    }

    fn dispatcher(threshold: u32) -> Dispatcher {
        let runtime = TaskRuntime::start(RuntimeConfig {
            max_workers: 2,
            poll_interval: Duration::from_millis(10),
        });
        let breakers = Arc::new(BreakerRegistry::new(IsolatorConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_secs(60),
        }));
        let retry = RetryPolicy::new(3, Duration::from_millis(5));
        Dispatcher::new(runtime, breakers, Arc::new(ErrorLedger::new()), retry)
    }

    #[tokio::test]
    async fn unknown_operation() {
        let d = dispatcher(5);
        let err = d.invoke("nope", json!({}), "u", false).await.unwrap_err();
        assert!(matches!(err, DispatchError::UnknownOperation { .. }));
    }

    #[tokio::test]
    async fn inline_call_retries_transient_failures() {
        let d = dispatcher(5);
        d.register(Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_first: 2,
            transient: true,
        }))
        .await;

        let result = d.invoke("flaky", json!({}), "u", false).await.unwrap();
        assert_eq!(result, Invocation::Completed { value: json!({ "call": 3 }) });

        let records = d.ledger().recent(10);
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].attempt_count, 3);
    }

    #[tokio::test]
    async fn open_breaker_maps_to_unavailable() {
        let d = dispatcher(2);
        d.register(Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
            transient: false,
        }))
        .await;

        for _ in 0..2 {
            let err = d.invoke("flaky", json!({}), "u", false).await.unwrap_err();
            assert!(matches!(err, DispatchError::Failed { .. }));
        }
        let err = d.invoke("flaky", json!({}), "u", false).await.unwrap_err();
        assert!(matches!(err, DispatchError::Unavailable { .. }));
    }

    /// Always fails with a transient error.
    struct Outage;

    #[async_trait]
    impl Operation for Outage {
        fn name(&self) -> &str {
            "outage"
        }

        async fn execute(&self, _args: serde_json::Value, _ctx: TaskContext) -> Result<serde_json::Value, TaskError> {
            Err(TaskError::transient("upstream down"))
        }
    }

    #[tokio::test]
    async fn failure_carries_suggested_strategy() {
        let d = dispatcher(10);
        d.register(Arc::new(Outage)).await;

        // No recovery on record yet.
        let err = d.invoke("outage", json!({}), "u", false).await.unwrap_err();
        assert!(matches!(err, DispatchError::Failed { strategy: None, .. }));

        d.register(Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_first: 1,
            transient: true,
        }))
        .await;
        d.invoke("flaky", json!({}), "u", false).await.unwrap();

        // A transient failure that recovered on attempt 2 suggests retrying.
        let err = d.invoke("outage", json!({}), "u", false).await.unwrap_err();
        match err {
            DispatchError::Failed { source, strategy, .. } => {
                assert!(source.is_transient());
                assert_eq!(strategy, Some(RecoveryStrategy::Retry));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(d.ledger().stats().total_records, 3);
    }

    #[tokio::test]
    async fn background_invocation_becomes_task() {
        let d = dispatcher(5);
        d.register(Arc::new(Doubler)).await;

        let Invocation::Submitted { task_id } = d.invoke("double", json!({"n": 21}), "userA", true).await.unwrap() else {
            panic!("expected a submitted task");
        };
        let value = d.runtime().wait(task_id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(value, json!(42));
        let snapshot = d.runtime().get_status(task_id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Completed);
        assert_eq!(snapshot.owner, "userA");
        assert_eq!(snapshot.mode, ExecutionMode::Background);
    }

    #[tokio::test]
    async fn foreground_only_operation_runs_inline_when_background_requested() {
        let d = dispatcher(5);
        d.register(Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_first: 0,
            transient: true,
        }))
        .await;

        let result = d.invoke("flaky", json!({}), "u", true).await.unwrap();
        assert!(matches!(result, Invocation::Completed { .. }));
        assert_eq!(d.capabilities("flaky").await, Some(Capabilities::default()));
        assert_eq!(d.names().await, vec!["flaky".to_string()]);
    }
}
