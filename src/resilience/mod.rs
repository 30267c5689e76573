//! Failure isolation and retry.
//!
//! - `breaker` — per-operation circuit breaker and its registry
//! - `retry` — bounded exponential-backoff retry
//! - `ledger` — append-only retry history and recovery suggestions

pub mod breaker;
pub mod ledger;
pub mod retry;

pub use breaker::{BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use ledger::{ErrorLedger, ErrorRecord, ErrorStats, RecoveryStrategy};
pub use retry::{RetryPolicy, retry_with_backoff, retry_with_backoff_if};
