//! Bounded exponential-backoff retry.
//!
//! The delay before attempt `k` (`k > 1`) is
//! `min(max_delay, base_delay × backoff_exponent^(k-1))`. Every call that
//! ends in failure, and every call that succeeds after at least one failed
//! attempt, appends an [`ErrorRecord`] to the shared [`ErrorLedger`].

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::Classify;
use crate::resilience::ledger::{ErrorLedger, ErrorRecord};

/// Retry parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_exponent: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_exponent: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_exponent(mut self, backoff_exponent: f64) -> Self {
        self.backoff_exponent = backoff_exponent;
        self
    }

    /// Delay to sleep before `attempt` (1-indexed). Zero for the first attempt.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = (attempt - 1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_exponent.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Retry `operation` under `policy`, treating every error as retryable.
pub async fn retry_with_backoff<F, Fut, T, E>(
    ledger: &ErrorLedger,
    policy: &RetryPolicy,
    context: serde_json::Value,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify,
{
    retry_with_backoff_if(ledger, policy, context, operation, |_| true).await
}

/// Retry `operation` under `policy` while `should_retry` accepts the error.
///
/// A rejected error or exhausted attempts returns the last error and appends
/// a failed record. Success after a failure appends a successful record
/// carrying the attempt count.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    ledger: &ErrorLedger,
    policy: &RetryPolicy,
    context: serde_json::Value,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_failure: Option<(&'static str, String)> = None;
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if let Some((kind, message)) = last_failure {
                    info!(kind, attempt, "Recovered after retry");
                    ledger.record(ErrorRecord {
                        kind: kind.to_string(),
                        message,
                        timestamp: Utc::now(),
                        context,
                        attempt_count: attempt,
                        success: true,
                    });
                }
                return Ok(value);
            }
            Err(e) => {
                if !should_retry(&e) || attempt >= max_attempts {
                    warn!(kind = e.kind(), attempt, error = %e, "Giving up after retries");
                    ledger.record(ErrorRecord {
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                        timestamp: Utc::now(),
                        context,
                        attempt_count: attempt,
                        success: false,
                    });
                    return Err(e);
                }

                attempt += 1;
                let delay = policy.delay_before(attempt);
                warn!(
                    attempt = attempt - 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                last_failure = Some((e.kind(), e.to_string()));
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::TaskError;

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500));
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert_eq!(policy.delay_before(2), Duration::from_millis(200));
        assert_eq!(policy.delay_before(3), Duration::from_millis(400));
        assert_eq!(policy.delay_before(4), Duration::from_millis(500));
        assert_eq!(policy.delay_before(100), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt_records_recovery() {
        let ledger = ErrorLedger::new();
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let calls = AtomicU32::new(0);

        let result = retry_with_backoff(&ledger, &policy, serde_json::json!({"op": "fetch"}), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(TaskError::transient(format!("attempt {n}")))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let records = ledger.recent(10);
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].attempt_count, 3);
        assert_eq!(records[0].kind, "transient");
        assert_eq!(records[0].context["op"], "fetch");
    }

    #[tokio::test]
    async fn first_try_success_records_nothing() {
        let ledger = ErrorLedger::new();
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let result: Result<u8, TaskError> =
            retry_with_backoff(&ledger, &policy, serde_json::Value::Null, || async { Ok(1) }).await;
        assert_eq!(result.unwrap(), 1);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn exhausted_attempts_return_last_error() {
        let ledger = ErrorLedger::new();
        let policy = RetryPolicy::new(2, Duration::from_millis(5));
        let calls = AtomicU32::new(0);

        let result: Result<(), TaskError> =
            retry_with_backoff(&ledger, &policy, serde_json::Value::Null, || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(TaskError::transient(format!("attempt {n}"))) }
            })
            .await;

        assert_eq!(result.unwrap_err(), TaskError::transient("attempt 2"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let records = ledger.recent(10);
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert_eq!(records[0].attempt_count, 2);
    }

    #[tokio::test]
    async fn predicate_stops_retrying() {
        let ledger = ErrorLedger::new();
        let policy = RetryPolicy::new(5, Duration::from_millis(5));
        let calls = AtomicU32::new(0);

        let result: Result<(), TaskError> = retry_with_backoff_if(
            &ledger,
            &policy,
            serde_json::Value::Null,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TaskError::failed("bad input")) }
            },
            TaskError::is_transient,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.recent(1)[0].kind, "task_failure");
    }
}
