//! Delivery session registry.
//!
//! One [`Session`] per owning identity. Results are pushed straight to the
//! attached connection when there is one; anything that cannot be delivered
//! is queued and replayed, in order, on the next `deliver_pending`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::session::model::{Connection, HistoryEntry, PendingResult, Session, SessionInfo};
use crate::session::sink::{DeliveryMessage, ResultSink};
use crate::worker::runtime::CompletionNotifier;
use crate::worker::task::{TaskId, TaskOutcome};

/// Registry of delivery sessions keyed by identity.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    task_owners: RwLock<HashMap<TaskId, String>>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            task_owners: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Get the session for `identity`, creating it on first reference.
    async fn session(&self, identity: &str) -> Arc<Mutex<Session>> {
        if let Some(session) = self.sessions.read().await.get(identity) {
            return Arc::clone(session);
        }

        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(identity.to_string()).or_insert_with(|| {
            debug!(identity = %identity, "Creating session");
            Arc::new(Mutex::new(Session::new(identity, self.config.max_history)))
        });
        Arc::clone(session)
    }

    async fn existing(&self, identity: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().await.get(identity).cloned()
    }

    async fn all(&self) -> Vec<Arc<Mutex<Session>>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Attach a live connection and mark the session online. Queued results
    /// stay queued until `deliver_pending`.
    ///
    /// Returns the id of the new connection alongside the session summary.
    pub async fn connect(&self, identity: &str, sink: Arc<dyn ResultSink>) -> (Uuid, SessionInfo) {
        let session = self.session(identity).await;
        let mut session = session.lock().await;

        let connection_id = Uuid::new_v4();
        if session.connection.is_some() {
            debug!(identity = %identity, "Replacing existing connection");
        }
        session.connection = Some(Connection {
            id: connection_id,
            sink,
        });
        session.online = true;
        session.touch();

        info!(
            identity = %identity,
            connection_id = %connection_id,
            pending = session.undelivered(),
            "Session connected"
        );
        (connection_id, session.info())
    }

    /// Mark the session offline and detach its connection. Queued results and
    /// in-flight tasks are kept. Returns false for unknown identities.
    pub async fn disconnect(&self, identity: &str) -> bool {
        let Some(session) = self.existing(identity).await else {
            return false;
        };
        let mut session = session.lock().await;
        session.online = false;
        session.connection = None;
        session.touch();
        info!(identity = %identity, "Session disconnected");
        true
    }

    /// Disconnect only if `connection_id` is still the attached connection.
    pub async fn release(&self, identity: &str, connection_id: Uuid) -> bool {
        let Some(session) = self.existing(identity).await else {
            return false;
        };
        let mut session = session.lock().await;
        if session.connection_id() != Some(connection_id) {
            debug!(identity = %identity, connection_id = %connection_id, "Stale connection closed");
            return false;
        }
        session.online = false;
        session.connection = None;
        session.touch();
        info!(identity = %identity, connection_id = %connection_id, "Session disconnected");
        true
    }

    /// Associate a submitted task with its owner until its result is stored.
    pub async fn register_task(&self, identity: &str, task_id: TaskId) {
        self.task_owners
            .write()
            .await
            .insert(task_id, identity.to_string());

        let session = self.session(identity).await;
        let mut session = session.lock().await;
        if !session.in_flight.contains(&task_id) {
            session.in_flight.push(task_id);
        }
    }

    pub async fn owner_of(&self, task_id: TaskId) -> Option<String> {
        self.task_owners.read().await.get(&task_id).cloned()
    }

    /// Deliver an outcome now if the owner is online, otherwise queue it.
    ///
    /// Returns true when the result reached the connection directly.
    pub async fn store_result(&self, identity: &str, task_id: TaskId, outcome: TaskOutcome) -> bool {
        self.task_owners.write().await.remove(&task_id);

        let session = self.session(identity).await;
        let mut session = session.lock().await;
        session.in_flight.retain(|id| *id != task_id);

        if session.online
            && let Some(connection) = &session.connection
        {
            let message = DeliveryMessage::task_result(task_id, outcome.clone(), false);
            match connection.sink.send(&message).await {
                Ok(()) => {
                    session.touch();
                    info!(identity = %identity, task_id = %task_id, "Result delivered");
                    return true;
                }
                Err(e) => {
                    warn!(identity = %identity, task_id = %task_id, error = %e, "Delivery failed, queueing result");
                }
            }
        }

        session.pending.push_back(PendingResult::new(task_id, outcome));
        debug!(
            identity = %identity,
            task_id = %task_id,
            pending = session.pending.len(),
            "Result queued"
        );
        false
    }

    /// Replay queued results in order. Stops at the first failure and leaves
    /// the rest queued. Returns how many were delivered.
    pub async fn deliver_pending(&self, identity: &str) -> usize {
        let Some(session) = self.existing(identity).await else {
            return 0;
        };
        let mut session = session.lock().await;
        if !session.online {
            return 0;
        }
        let Some(sink) = session.connection.as_ref().map(|c| Arc::clone(&c.sink)) else {
            return 0;
        };

        let mut delivered = 0;
        while let Some(front) = session.pending.front_mut() {
            if !front.delivered {
                let message = DeliveryMessage::task_result(front.task_id, front.outcome.clone(), true);
                if let Err(e) = sink.send(&message).await {
                    warn!(
                        identity = %identity,
                        task_id = %front.task_id,
                        error = %e,
                        "Replay stopped, result stays queued"
                    );
                    break;
                }
                front.delivered = true;
                delivered += 1;
            }
            session.pending.pop_front();
        }

        if delivered > 0 {
            session.touch();
            info!(identity = %identity, delivered, "Delivered pending results");
        }
        delivered
    }

    /// Undelivered results queued for `identity`.
    pub async fn pending_count(&self, identity: &str) -> usize {
        match self.existing(identity).await {
            Some(session) => session.lock().await.undelivered(),
            None => 0,
        }
    }

    /// Drop offline sessions idle for longer than `max_inactive`.
    pub async fn cleanup_idle(&self, max_inactive: Duration) -> usize {
        let max_inactive = chrono::Duration::from_std(max_inactive).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = Utc::now().checked_sub_signed(max_inactive) else {
            return 0;
        };

        let mut removed = Vec::new();
        {
            let mut sessions = self.sessions.write().await;
            sessions.retain(|identity, session| {
                // A locked session is in use.
                let Ok(session) = session.try_lock() else {
                    return true;
                };
                let idle = !session.online && session.last_active < cutoff;
                if idle {
                    removed.push(identity.clone());
                }
                !idle
            });
        }

        if !removed.is_empty() {
            self.task_owners
                .write()
                .await
                .retain(|_, owner| !removed.contains(owner));
            info!(removed = removed.len(), "Cleaned up idle sessions");
        }
        removed.len()
    }

    pub async fn is_online(&self, identity: &str) -> bool {
        match self.existing(identity).await {
            Some(session) => session.lock().await.online,
            None => false,
        }
    }

    pub async fn online_identities(&self) -> Vec<String> {
        let mut online = Vec::new();
        for session in self.all().await {
            let session = session.lock().await;
            if session.online {
                online.push(session.identity.clone());
            }
        }
        online.sort();
        online
    }

    pub async fn session_info(&self, identity: &str) -> Option<SessionInfo> {
        let session = self.existing(identity).await?;
        let info = session.lock().await.info();
        Some(info)
    }

    /// Summaries of every session, sorted by identity.
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos = Vec::new();
        for session in self.all().await {
            infos.push(session.lock().await.info());
        }
        infos.sort_by(|a, b| a.identity.cmp(&b.identity));
        infos
    }

    pub async fn add_message(&self, identity: &str, role: &str, content: &str) {
        let session = self.session(identity).await;
        let mut session = session.lock().await;
        session.history.push(role, content);
        session.touch();
    }

    pub async fn recent_messages(&self, identity: &str, limit: usize) -> Vec<HistoryEntry> {
        match self.existing(identity).await {
            Some(session) => session.lock().await.history.last_n(limit),
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl CompletionNotifier for SessionRegistry {
    async fn notify(&self, owner: &str, task_id: TaskId, outcome: TaskOutcome) {
        if owner.is_empty() {
            debug!(task_id = %task_id, "Task has no owner, dropping outcome");
            return;
        }
        self.store_result(owner, task_id, outcome).await;
    }

    async fn task_submitted(&self, owner: &str, task_id: TaskId) {
        if !owner.is_empty() {
            self.register_task(owner, task_id).await;
        }
    }
}

/// Shortest sweep period the reaper accepts.
const MIN_REAP_INTERVAL: Duration = Duration::from_millis(1);

/// Periodically drop idle offline sessions.
pub fn spawn_idle_reaper(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    max_inactive: Duration,
) -> JoinHandle<()> {
    let interval = interval.max(MIN_REAP_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_idle(max_inactive).await;
            debug!(removed, "Idle session sweep");
        }
    })
}
