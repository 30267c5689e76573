//! Result sinks: where a delivered result goes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::DeliveryError;
use crate::worker::task::{TaskId, TaskOutcome};

/// Outbound buffer between the registry and a connection's writer.
const OUTBOUND_CAPACITY: usize = 32;

/// Message pushed to a connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryMessage {
    TaskResult {
        task_id: TaskId,
        result: TaskOutcome,
        timestamp: DateTime<Utc>,
        /// True when the result was queued while the owner was offline.
        offline_completed: bool,
    },
}

impl DeliveryMessage {
    pub fn task_result(task_id: TaskId, result: TaskOutcome, offline_completed: bool) -> Self {
        Self::TaskResult {
            task_id,
            result,
            timestamp: Utc::now(),
            offline_completed,
        }
    }

    pub fn task_id(&self) -> TaskId {
        match self {
            Self::TaskResult { task_id, .. } => *task_id,
        }
    }
}

/// A live connection that can accept results.
///
/// `send` returns only after the transport confirms the write.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn send(&self, message: &DeliveryMessage) -> Result<(), DeliveryError>;
}

/// A message waiting to be written, with its acknowledgement.
#[derive(Debug)]
pub struct OutboundDelivery {
    pub message: DeliveryMessage,
    ack: oneshot::Sender<Result<(), DeliveryError>>,
}

impl OutboundDelivery {
    /// Report the write result back to the registry.
    pub fn ack(self, result: Result<(), DeliveryError>) {
        let _ = self.ack.send(result);
    }
}

/// Sink backed by a channel to the connection's writer task.
pub struct ChannelSink {
    identity: String,
    tx: mpsc::Sender<OutboundDelivery>,
    timeout: Duration,
}

impl ChannelSink {
    pub fn new(identity: impl Into<String>, timeout: Duration) -> (Self, mpsc::Receiver<OutboundDelivery>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let sink = Self {
            identity: identity.into(),
            tx,
            timeout,
        };
        (sink, rx)
    }

    fn closed(&self) -> DeliveryError {
        DeliveryError::ConnectionClosed {
            identity: self.identity.clone(),
        }
    }
}

#[async_trait]
impl ResultSink for ChannelSink {
    async fn send(&self, message: &DeliveryMessage) -> Result<(), DeliveryError> {
        let (ack, ack_rx) = oneshot::channel();
        let delivery = OutboundDelivery {
            message: message.clone(),
            ack,
        };

        let confirmed = async {
            self.tx.send(delivery).await.map_err(|_| self.closed())?;
            ack_rx.await.map_err(|_| self.closed())?
        };

        tokio::time::timeout(self.timeout, confirmed)
            .await
            .map_err(|_| DeliveryError::Timeout {
                identity: self.identity.clone(),
                timeout: self.timeout,
            })?
    }
}
