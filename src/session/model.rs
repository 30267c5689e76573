//! Session data model.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::sink::ResultSink;
use crate::worker::task::{TaskId, TaskOutcome};

/// A completed task's outcome waiting for its owner to come back online.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingResult {
    pub task_id: TaskId,
    pub outcome: TaskOutcome,
    pub created_at: DateTime<Utc>,
    /// Flips to true once, when the owner acknowledges receipt.
    pub delivered: bool,
}

impl PendingResult {
    pub fn new(task_id: TaskId, outcome: TaskOutcome) -> Self {
        Self {
            task_id,
            outcome,
            created_at: Utc::now(),
            delivered: false,
        }
    }
}

/// One entry of the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Bounded conversation history. Oldest entries are dropped first.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    entries: VecDeque<HistoryEntry>,
    max_entries: usize,
}

impl ConversationHistory {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries.min(64)),
            max_entries,
        }
    }

    pub fn push(&mut self, role: impl Into<String>, content: impl Into<String>) {
        if self.max_entries == 0 {
            return;
        }
        while self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry {
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
        });
    }

    /// The last `n` entries, oldest first.
    pub fn last_n(&self, n: usize) -> Vec<HistoryEntry> {
        let start = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The live connection attached to an online session.
pub(crate) struct Connection {
    pub(crate) id: Uuid,
    pub(crate) sink: Arc<dyn ResultSink>,
}

/// Per-identity delivery state.
pub struct Session {
    pub identity: String,
    pub online: bool,
    pub(crate) connection: Option<Connection>,
    /// Tasks submitted on behalf of this identity that have not reported back.
    pub in_flight: Vec<TaskId>,
    pub pending: VecDeque<PendingResult>,
    pub history: ConversationHistory,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Session {
    pub fn new(identity: impl Into<String>, max_history: usize) -> Self {
        let now = Utc::now();
        Self {
            identity: identity.into(),
            online: false,
            connection: None,
            in_flight: Vec::new(),
            pending: VecDeque::new(),
            history: ConversationHistory::new(max_history),
            created_at: now,
            last_active: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }

    pub fn connection_id(&self) -> Option<Uuid> {
        self.connection.as_ref().map(|c| c.id)
    }

    /// Number of queued results not yet delivered.
    pub fn undelivered(&self) -> usize {
        self.pending.iter().filter(|p| !p.delivered).count()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            identity: self.identity.clone(),
            online: self.online,
            connection_id: self.connection_id(),
            in_flight: self.in_flight.clone(),
            pending_results: self.undelivered(),
            history_len: self.history.len(),
            created_at: self.created_at,
            last_active: self.last_active,
        }
    }
}

/// Serialisable summary of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub identity: String,
    pub online: bool,
    pub connection_id: Option<Uuid>,
    pub in_flight: Vec<TaskId>,
    pub pending_results: usize,
    pub history_len: usize,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}
