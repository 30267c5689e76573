//! Failure isolator (circuit breaker).
//!
//! One [`CircuitBreaker`] exists per operation name and is shared by every
//! concurrent caller of that operation. State lives in atomics so callers on
//! the async scheduler and on worker threads can update it without a lock.
//!
//! ```text
//!  closed ──(failures ≥ threshold)──▶ open
//!    ▲                                 │
//!    │                    (recovery_timeout elapsed)
//!    │                                 ▼
//!    └────────(success)──────────── half_open ──(failure)──▶ open
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::IsolatorConfig;
use crate::error::IsolatorError;

/// State of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow through.
    Closed,
    /// Calls fail fast without invoking the operation.
    Open,
    /// Recovery timeout elapsed; the next call probes the operation.
    HalfOpen,
}

impl BreakerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

/// Serializable view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub operation: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: f64,
    /// Seconds since the last recorded failure, if any.
    pub since_last_failure_secs: Option<f64>,
}

/// Per-operation failure isolator.
#[derive(Debug)]
pub struct CircuitBreaker {
    operation: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    state: AtomicU8,
    failures: AtomicU32,
    /// Millis since `epoch` of the last failure, plus one. Zero means none.
    last_failure: AtomicU64,
    epoch: Instant,
}

impl CircuitBreaker {
    /// Create a closed breaker for `operation`.
    pub fn new(operation: impl Into<String>, config: &IsolatorConfig) -> Self {
        Self {
            operation: operation.into(),
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: config.recovery_timeout,
            state: AtomicU8::new(BreakerState::Closed.as_u8()),
            failures: AtomicU32::new(0),
            last_failure: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Current state, without triggering the open → half-open transition.
    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Consecutive failures recorded since the last success.
    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Run `operation` through the breaker.
    ///
    /// When open and the recovery timeout has not elapsed, returns
    /// [`IsolatorError::Open`] without calling `operation`.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, IsolatorError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit()?;
        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(IsolatorError::Inner(e))
            }
        }
    }

    /// Manually close the breaker and clear the failure count.
    pub fn reset(&self) {
        self.failures.store(0, Ordering::Release);
        self.state
            .store(BreakerState::Closed.as_u8(), Ordering::Release);
        info!(operation = %self.operation, "Isolator manually reset");
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            operation: self.operation.clone(),
            state: self.state(),
            consecutive_failures: self.failure_count(),
            failure_threshold: self.failure_threshold,
            recovery_timeout_secs: self.recovery_timeout.as_secs_f64(),
            since_last_failure_secs: self.since_last_failure().map(|d| d.as_secs_f64()),
        }
    }

    /// Decide whether a call may proceed, moving open → half-open if due.
    fn admit<E>(&self) -> Result<(), IsolatorError<E>> {
        if self.state() != BreakerState::Open {
            return Ok(());
        }

        let elapsed = self.since_last_failure().unwrap_or(self.recovery_timeout);
        if elapsed >= self.recovery_timeout {
            if self
                .state
                .compare_exchange(
                    BreakerState::Open.as_u8(),
                    BreakerState::HalfOpen.as_u8(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                info!(operation = %self.operation, "Isolator half-open, probing");
            }
            return Ok(());
        }

        let retry_in = self.recovery_timeout - elapsed;
        debug!(
            operation = %self.operation,
            retry_in_ms = retry_in.as_millis() as u64,
            "Isolator open, failing fast"
        );
        Err(IsolatorError::Open {
            operation: self.operation.clone(),
            retry_in,
        })
    }

    fn on_success(&self) {
        self.failures.store(0, Ordering::Release);
        if self
            .state
            .compare_exchange(
                BreakerState::HalfOpen.as_u8(),
                BreakerState::Closed.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            info!(operation = %self.operation, "Isolator closed after successful probe");
        }
    }

    fn on_failure(&self) {
        let count = self.failures.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        self.last_failure.store(now_ms + 1, Ordering::Release);

        if count >= self.failure_threshold {
            let previous =
                BreakerState::from_u8(self.state.swap(BreakerState::Open.as_u8(), Ordering::AcqRel));
            if previous != BreakerState::Open {
                warn!(
                    operation = %self.operation,
                    failures = count,
                    from = %previous,
                    "Isolator opened"
                );
            }
        }
    }

    fn since_last_failure(&self) -> Option<Duration> {
        match self.last_failure.load(Ordering::Acquire) {
            0 => None,
            stamp => {
                let at = Duration::from_millis(stamp - 1);
                Some(self.epoch.elapsed().saturating_sub(at))
            }
        }
    }
}

/// Lazily-populated map of breakers, one per operation name.
pub struct BreakerRegistry {
    config: IsolatorConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: IsolatorConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Get the breaker for `operation`, creating it on first use.
    pub async fn get(&self, operation: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(operation) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write().await;
        Arc::clone(
            breakers
                .entry(operation.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(operation, &self.config))),
        )
    }

    /// Snapshots of every breaker, sorted by operation name.
    pub async fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> = self
            .breakers
            .read()
            .await
            .values()
            .map(|b| b.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.operation.cmp(&b.operation));
        snapshots
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(IsolatorConfig::default())
    }
}
