//! Built-in operations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::dispatch::{Capabilities, Dispatcher, Operation};
use crate::error::TaskError;
use crate::worker::task::TaskContext;

/// Longest countdown accepted, in seconds.
const MAX_COUNTDOWN_SECS: u64 = 3600;

/// Counts down `seconds`, reporting progress once per second.
#[derive(Debug, Default)]
pub struct Countdown {
    tick: Option<Duration>,
}

impl Countdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a shorter tick than one second.
    pub fn with_tick(tick: Duration) -> Self {
        Self { tick: Some(tick) }
    }
}

#[async_trait]
impl Operation for Countdown {
    fn name(&self) -> &str {
        "countdown"
    }

    fn description(&self) -> &str {
        "Wait for the given number of seconds, reporting progress each second"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_background: true,
            reports_progress: true,
        }
    }

    async fn execute(&self, args: serde_json::Value, ctx: TaskContext) -> Result<serde_json::Value, TaskError> {
        let seconds = args
            .get("seconds")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| TaskError::failed("countdown requires a non-negative integer 'seconds'"))?;
        if seconds > MAX_COUNTDOWN_SECS {
            return Err(TaskError::failed(format!(
                "countdown is limited to {MAX_COUNTDOWN_SECS} seconds"
            )));
        }

        let tick = self.tick.unwrap_or(Duration::from_secs(1));
        for elapsed in 1..=seconds {
            tokio::time::sleep(tick).await;
            if ctx.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            ctx.report_progress(elapsed as f64 / seconds as f64);
        }

        Ok(json!({
            "message": format!("Countdown of {seconds} seconds finished"),
            "seconds": seconds,
        }))
    }
}

/// Returns its arguments.
#[derive(Debug, Default)]
pub struct Echo;

#[async_trait]
impl Operation for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo back the arguments"
    }

    async fn execute(&self, args: serde_json::Value, _ctx: TaskContext) -> Result<serde_json::Value, TaskError> {
        Ok(json!({ "echo": args }))
    }
}

/// Register the built-in operations.
pub async fn register_builtin(dispatcher: &Dispatcher) {
    dispatcher.register(Arc::new(Countdown::new())).await;
    dispatcher.register(Arc::new(Echo)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn countdown_returns_seconds() {
        let op = Countdown::with_tick(Duration::from_millis(5));
        let value = op.execute(json!({"seconds": 3}), TaskContext::detached()).await.unwrap();
        assert_eq!(value["seconds"], 3);
        assert!(value["message"].as_str().unwrap().contains("3 seconds"));
    }

    #[tokio::test]
    async fn countdown_rejects_bad_args() {
        let op = Countdown::with_tick(Duration::from_millis(1));
        assert!(op.execute(json!({}), TaskContext::detached()).await.is_err());
        assert!(op.execute(json!({"seconds": -1}), TaskContext::detached()).await.is_err());
        assert!(op.execute(json!({"seconds": 999_999}), TaskContext::detached()).await.is_err());
    }

    #[tokio::test]
    async fn echo_wraps_args() {
        let value = Echo.execute(json!({"a": 1}), TaskContext::detached()).await.unwrap();
        assert_eq!(value, json!({"echo": {"a": 1}}));
        assert!(!Echo.capabilities().supports_background);
    }
}
