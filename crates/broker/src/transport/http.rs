// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! REST endpoints for the one-shot broker operations (§4.9).

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::command::Target;
use crate::error::{BrokerError, ErrorKind};
use crate::injector::ReplyCapability;
use crate::lifecycle::LifecycleState;

use super::{AppState, ReadyState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/ready", get(ready))
        .route("/api/v1/agents", get(list_agents).post(spawn_agent))
        .route("/api/v1/agents/{name}", delete(release_agent))
        .route("/api/v1/messages", post(send_message))
        .route("/api/v1/relay/inbound", post(relay_inbound))
        .route("/api/v1/shutdown", post(shutdown))
}

/// Wraps a [`BrokerError`] so it implements [`IntoResponse`] per the status
/// mapping in §7/§4.9.
struct ApiError(BrokerError);

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = Json(serde_json::json!({
            "error": self.0.kind.as_str(),
            "detail": self.0.detail,
        }))
        .into_response();
        *response.status_mut() = status;
        if self.0.kind == ErrorKind::RateLimited {
            response
                .headers_mut()
                .insert("Retry-After", axum::http::HeaderValue::from_static("5"));
        }
        response
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "running"}))
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let ready_state = state.ready_state();
    let status = if ready_state == ReadyState::Fatal { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::OK };
    (status, Json(serde_json::json!({"state": ready_state})))
}

async fn list_agents(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.broker.list_agents().await)
}

#[derive(Debug, Deserialize)]
struct SpawnRequest {
    name: String,
    cli: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    channels: Vec<String>,
    /// Whether this agent understands the MCP-style reply tool, vs. the
    /// plain in-band `<<<RELAY ... RELAY>>>` reply instructions (§4.5).
    #[serde(default)]
    mcp_reply: bool,
}

async fn spawn_agent(
    State(state): State<AppState>,
    Json(req): Json<SpawnRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut command = vec![req.cli.clone()];
    command.extend(req.args);
    let capability = if req.mcp_reply { ReplyCapability::McpReply } else { ReplyCapability::InBandOnly };
    let snapshot =
        state.broker.spawn_pty(&req.name, &req.cli, &command, req.channels, capability).await?;
    Ok(Json(snapshot))
}

async fn release_agent(State(state): State<AppState>, Path(name): Path<String>) -> Result<impl IntoResponse, ApiError> {
    state.broker.release(&name, Some("released via transport".to_string())).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    from: String,
    to: String,
    body: String,
    /// Milliseconds to hold the response open for a terminal delivery
    /// state; absent means don't await one at all (§8 Open Questions:
    /// `AWAIT` must carry an explicit duration).
    await_timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct SendMessageResponse {
    delivery_ids: Vec<String>,
    terminal: Option<String>,
}

const AWAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

async fn send_message(
    State(state): State<AppState>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let target = Target::parse(&req.to).ok_or_else(|| BrokerError::invalid_target(format!("bad TO: {}", req.to)))?;
    let await_timeout = req.await_timeout_ms.map(Duration::from_millis);
    let delivery_ids = state.broker.send_message(&req.from, &target, &req.body, await_timeout).await?;

    let mut terminal = None;
    if let Some(timeout) = await_timeout {
        if let Some(first) = delivery_ids.first() {
            terminal = await_terminal_state(&state, first, timeout).await;
        }
    }

    Ok(Json(SendMessageResponse { delivery_ids, terminal }))
}

/// Hold the response open until `delivery_id` reaches a terminal state or
/// `timeout` elapses (§4.9: "honors AWAIT by holding the HTTP response open
/// until terminal state or deadline").
async fn await_terminal_state(state: &AppState, delivery_id: &str, timeout: Duration) -> Option<String> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(LifecycleState::Terminal(reason)) = state.broker.lifecycle_state(delivery_id).await {
            return Some(reason.as_str().to_string());
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(AWAIT_POLL_INTERVAL).await;
    }
}

async fn relay_inbound(
    State(state): State<AppState>,
    Json(raw): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    state.broker.ingest_inbound_relay(&raw).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn shutdown(State(state): State<AppState>) -> impl IntoResponse {
    state.broker.request_shutdown();
    Json(serde_json::json!({"accepted": true}))
}
