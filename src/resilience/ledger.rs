//! Append-only error ledger and recovery-strategy suggestions.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum records retained before the oldest are dropped.
const MAX_RECORDS: usize = 1000;

/// A single ledger entry. Never mutated after it is appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Short error kind, e.g. `transient`.
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Free-form caller context (operation name, arguments, provider).
    pub context: serde_json::Value,
    /// Attempt number at which the record was written.
    pub attempt_count: u32,
    /// True only when written after an eventual successful retry.
    pub success: bool,
}

/// Suggested next step for a kind of error, derived from past retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Past retries recovered quickly; retry again.
    Retry,
    /// Recovery took several attempts; try another provider.
    SwitchProvider,
    /// Retrying rarely pays off; use a fallback action.
    Fallback,
}

/// Aggregate for one error kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorPattern {
    pub count: usize,
    pub success_count: usize,
    /// Mean attempt count over successful retries.
    pub avg_success_attempts: f64,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Per-kind counts in [`ErrorStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KindStats {
    pub total: usize,
    pub recovered: usize,
}

/// Ledger-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorStats {
    pub total_records: usize,
    pub successful_recoveries: usize,
    pub recovery_rate: f64,
    pub by_kind: HashMap<String, KindStats>,
}

/// Shared, append-only history of retry outcomes.
#[derive(Debug, Default)]
pub struct ErrorLedger {
    records: Mutex<Vec<ErrorRecord>>,
}

impl ErrorLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn record(&self, record: ErrorRecord) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.push(record);
        if records.len() > MAX_RECORDS {
            let drain_count = records.len() - MAX_RECORDS;
            records.drain(..drain_count);
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The most recent `limit` records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<ErrorRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let start = records.len().saturating_sub(limit);
        records[start..].to_vec()
    }

    /// Aggregate for one error kind, if any record of it exists.
    pub fn pattern(&self, kind: &str) -> Option<ErrorPattern> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut pattern = ErrorPattern::default();
        let mut attempt_sum = 0u64;

        for record in records.iter().filter(|r| r.kind == kind) {
            pattern.count += 1;
            pattern.last_seen = Some(record.timestamp);
            if record.success {
                pattern.success_count += 1;
                attempt_sum += u64::from(record.attempt_count);
            }
        }

        if pattern.count == 0 {
            return None;
        }
        if pattern.success_count > 0 {
            pattern.avg_success_attempts = attempt_sum as f64 / pattern.success_count as f64;
        }
        Some(pattern)
    }

    /// Suggest a strategy for `kind` based on past successful retries.
    ///
    /// `None` when no retry of this kind has ever succeeded.
    pub fn suggest_strategy(&self, kind: &str) -> Option<RecoveryStrategy> {
        let pattern = self.pattern(kind)?;
        if pattern.success_count == 0 {
            return None;
        }
        Some(if pattern.avg_success_attempts <= 2.0 {
            RecoveryStrategy::Retry
        } else if pattern.avg_success_attempts <= 4.0 {
            RecoveryStrategy::SwitchProvider
        } else {
            RecoveryStrategy::Fallback
        })
    }

    pub fn stats(&self) -> ErrorStats {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut stats = ErrorStats {
            total_records: records.len(),
            ..Default::default()
        };

        for record in records.iter() {
            let entry = stats.by_kind.entry(record.kind.clone()).or_default();
            entry.total += 1;
            if record.success {
                entry.recovered += 1;
                stats.successful_recoveries += 1;
            }
        }

        if stats.total_records > 0 {
            stats.recovery_rate = stats.successful_recoveries as f64 / stats.total_records as f64;
        }
        stats
    }
}
