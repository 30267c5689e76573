//! HTTP surface: REST endpoints plus the results WebSocket.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{ConnectInfo, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::dispatch::{Dispatcher, Invocation};
use crate::error::{DispatchError, RuntimeError};
use crate::session::{SessionRegistry, ws_routes};
use crate::worker::state::TaskStatus;
use crate::worker::task::TaskId;

/// Default page size for task listings.
const DEFAULT_LIST_LIMIT: usize = 50;

/// Default number of ledger records returned by `/api/errors`.
const DEFAULT_ERROR_LIMIT: usize = 20;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: Arc<SessionRegistry>,
}

/// Build the full router: REST routes and the results socket.
pub fn router(dispatcher: Arc<Dispatcher>, sessions: Arc<SessionRegistry>) -> Router {
    let state = AppState {
        dispatcher,
        sessions: Arc::clone(&sessions),
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/operations", get(list_operations))
        .route("/api/operations/{name}", post(invoke_operation))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/sessions", get(list_sessions))
        .route("/api/breakers", get(list_breakers))
        .route("/api/errors", get(error_report))
        .with_state(state)
        .merge(ws_routes(sessions))
}

fn error_body(status: StatusCode, message: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message.to_string() })))
}

fn parse_task_id(id: &str) -> Result<TaskId, (StatusCode, Json<serde_json::Value>)> {
    id.parse()
        .map_err(|_| error_body(StatusCode::BAD_REQUEST, "Invalid task ID"))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let runtime = state.dispatcher.runtime();
    let tasks = runtime.stats().await;
    Json(serde_json::json!({
        "status": "ok",
        "service": "assist-runtime",
        "tasks": tasks,
        "workers": runtime.workers(),
    }))
}

// ── Operations ──────────────────────────────────────────────────────────

async fn list_operations(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.dispatcher.names().await)
}

#[derive(Debug, Deserialize)]
struct InvokeRequest {
    #[serde(default)]
    args: serde_json::Value,
    #[serde(default)]
    background: bool,
    /// Who receives the result; defaults to the caller's IP.
    identity: Option<String>,
}

async fn invoke_operation(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(name): Path<String>,
    Json(body): Json<InvokeRequest>,
) -> impl IntoResponse {
    let owner = body
        .identity
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| addr.ip().to_string());

    match state
        .dispatcher
        .invoke(&name, body.args, &owner, body.background)
        .await
    {
        Ok(invocation @ Invocation::Submitted { .. }) => {
            (StatusCode::ACCEPTED, Json(serde_json::json!(invocation)))
        }
        Ok(invocation) => (StatusCode::OK, Json(serde_json::json!(invocation))),
        Err(e) => {
            let status = match &e {
                DispatchError::UnknownOperation { .. } => StatusCode::NOT_FOUND,
                DispatchError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                DispatchError::Failed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                DispatchError::Runtime(RuntimeError::ShutDown) => StatusCode::SERVICE_UNAVAILABLE,
                DispatchError::Runtime(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            warn!(operation = %name, owner = %owner, error = %e, "Invocation failed");
            if let DispatchError::Failed { strategy, .. } = &e {
                return (
                    status,
                    Json(serde_json::json!({ "error": e.to_string(), "strategy": strategy })),
                );
            }
            error_body(status, e)
        }
    }
}

// ── Tasks ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> impl IntoResponse {
    let status = match query.status.as_deref().map(str::parse::<TaskStatus>) {
        Some(Ok(status)) => Some(status),
        Some(Err(e)) => return error_body(StatusCode::BAD_REQUEST, e),
        None => None,
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let tasks = state.dispatcher.runtime().list(status, limit).await;
    (StatusCode::OK, Json(serde_json::json!(tasks)))
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let task_id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.dispatcher.runtime().get_status(task_id).await {
        Some(snapshot) => (StatusCode::OK, Json(serde_json::json!(snapshot))),
        None => error_body(StatusCode::NOT_FOUND, "Task not found"),
    }
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let task_id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    if state.dispatcher.runtime().cancel(task_id).await {
        info!(task_id = %task_id, "Task cancelled via API");
        (
            StatusCode::OK,
            Json(serde_json::json!({ "task_id": task_id, "status": "cancelled" })),
        )
    } else {
        error_body(StatusCode::NOT_FOUND, "Task not found or already finished")
    }
}

// ── Introspection ───────────────────────────────────────────────────────

async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.sessions.sessions().await)
}

async fn list_breakers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.dispatcher.breakers().snapshots().await)
}

#[derive(Debug, Deserialize)]
struct ErrorReportQuery {
    limit: Option<usize>,
}

async fn error_report(
    State(state): State<AppState>,
    Query(query): Query<ErrorReportQuery>,
) -> impl IntoResponse {
    let ledger = state.dispatcher.ledger();
    let limit = query.limit.unwrap_or(DEFAULT_ERROR_LIMIT);
    Json(serde_json::json!({
        "stats": ledger.stats(),
        "recent": ledger.recent(limit),
    }))
}
