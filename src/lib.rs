//! Assist runtime: task execution with failure isolation, retry and
//! per-identity result delivery.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod operations;
pub mod resilience;
pub mod session;
pub mod worker;

pub use config::AppConfig;
pub use error::{Error, Result};
