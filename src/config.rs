//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::resilience::retry::RetryPolicy;

/// Task runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Size of the blocking worker pool used for background tasks.
    pub max_workers: usize,
    /// Poll interval used by `wait()`.
    pub poll_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_workers: 5,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Failure isolator (circuit breaker) configuration.
#[derive(Debug, Clone)]
pub struct IsolatorConfig {
    /// Consecutive failures before the isolator opens.
    pub failure_threshold: u32,
    /// Time since the last failure before a probe call is let through.
    pub recovery_timeout: Duration,
}

impl Default for IsolatorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Delivery session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Conversation history entries kept per session.
    pub max_history: usize,
    /// Offline sessions idle longer than this are reaped.
    pub idle_timeout: Duration,
    /// How often the idle reaper runs.
    pub reap_interval: Duration,
    /// Upper bound on a single send through a live connection.
    pub delivery_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_history: 20,
            idle_timeout: Duration::from_secs(24 * 3600),
            reap_interval: Duration::from_secs(3600),
            delivery_timeout: Duration::from_secs(10),
        }
    }
}

/// Full application configuration for the server binary.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub runtime: RuntimeConfig,
    pub isolator: IsolatorConfig,
    pub retry: RetryPolicy,
    pub session: SessionConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            runtime: RuntimeConfig::default(),
            isolator: IsolatorConfig::default(),
            retry: RetryPolicy::default(),
            session: SessionConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `ASSIST_*` environment variables.
    ///
    /// Unset variables fall back to defaults; unparsable ones are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let max_workers: usize = parse_or(&get, "ASSIST_MAX_WORKERS", defaults.runtime.max_workers)?;
        if max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ASSIST_MAX_WORKERS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let poll_interval = non_zero(
            "ASSIST_POLL_INTERVAL_MS",
            millis_or(&get, "ASSIST_POLL_INTERVAL_MS", defaults.runtime.poll_interval)?,
        )?;
        let reap_interval = non_zero(
            "ASSIST_SESSION_REAP_SECS",
            secs_or(&get, "ASSIST_SESSION_REAP_SECS", defaults.session.reap_interval)?,
        )?;

        Ok(Self {
            port: parse_or(&get, "ASSIST_PORT", defaults.port)?,
            runtime: RuntimeConfig {
                max_workers,
                poll_interval,
            },
            isolator: IsolatorConfig {
                failure_threshold: parse_or(
                    &get,
                    "ASSIST_BREAKER_THRESHOLD",
                    defaults.isolator.failure_threshold,
                )?,
                recovery_timeout: secs_or(
                    &get,
                    "ASSIST_BREAKER_RECOVERY_SECS",
                    defaults.isolator.recovery_timeout,
                )?,
            },
            retry: RetryPolicy {
                max_attempts: parse_or(
                    &get,
                    "ASSIST_RETRY_MAX_ATTEMPTS",
                    defaults.retry.max_attempts,
                )?,
                base_delay: millis_or(
                    &get,
                    "ASSIST_RETRY_BASE_DELAY_MS",
                    defaults.retry.base_delay,
                )?,
                max_delay: millis_or(&get, "ASSIST_RETRY_MAX_DELAY_MS", defaults.retry.max_delay)?,
                backoff_exponent: parse_or(
                    &get,
                    "ASSIST_RETRY_EXPONENT",
                    defaults.retry.backoff_exponent,
                )?,
            },
            session: SessionConfig {
                max_history: parse_or(
                    &get,
                    "ASSIST_SESSION_MAX_HISTORY",
                    defaults.session.max_history,
                )?,
                idle_timeout: secs_or(
                    &get,
                    "ASSIST_SESSION_IDLE_SECS",
                    defaults.session.idle_timeout,
                )?,
                reap_interval,
                delivery_timeout: defaults.session.delivery_timeout,
            },
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

fn non_zero(key: &str, value: Duration) -> Result<Duration, ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn millis_or<G>(get: &G, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default.as_millis() as u64).map(Duration::from_millis)
}

fn secs_or<G>(get: &G, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default.as_secs()).map(Duration::from_secs)
}
