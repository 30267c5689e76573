//! WebSocket transport for result delivery.
//!
//! `GET /ws/results?identity=<id>` attaches the socket to the identity's
//! session (the peer IP when no identity is given), replays queued results
//! and then forwards new ones as they complete.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        ConnectInfo, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::DeliveryError;
use crate::session::registry::SessionRegistry;
use crate::session::sink::ChannelSink;

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    identity: Option<String>,
}

/// Router exposing the results socket.
pub fn ws_routes(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/ws/results", get(ws_handler))
        .with_state(registry)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<ResultsQuery>,
    State(registry): State<Arc<SessionRegistry>>,
) -> impl IntoResponse {
    let identity = query
        .identity
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| addr.ip().to_string());
    info!(identity = %identity, peer = %addr, "Results client connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, identity, registry))
}

async fn handle_socket(mut socket: WebSocket, identity: String, registry: Arc<SessionRegistry>) {
    let (sink, mut outbound) = ChannelSink::new(&identity, registry.config().delivery_timeout);
    let (connection_id, _) = registry.connect(&identity, Arc::new(sink)).await;

    // Replay runs concurrently: each send waits for this loop's ack.
    let replay_registry = Arc::clone(&registry);
    let replay_identity = identity.clone();
    tokio::spawn(async move {
        replay_registry.deliver_pending(&replay_identity).await;
    });

    loop {
        tokio::select! {
            delivery = outbound.recv() => {
                let Some(delivery) = delivery else {
                    debug!(identity = %identity, "Connection replaced by a newer one");
                    break;
                };
                let json = match serde_json::to_string(&delivery.message) {
                    Ok(json) => json,
                    Err(e) => {
                        delivery.ack(Err(DeliveryError::Serialization(e.to_string())));
                        continue;
                    }
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    delivery.ack(Err(DeliveryError::ConnectionClosed { identity: identity.clone() }));
                    debug!(identity = %identity, "Client disconnected during send");
                    break;
                }
                delivery.ack(Ok(()));
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        debug!(identity = %identity, text = %text.as_str(), "Ignoring client message");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(identity = %identity, "Results client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(identity = %identity, error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    registry.release(&identity, connection_id).await;
}
