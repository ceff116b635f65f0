// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bearer-token auth middleware for the transport surface (§4.9, §7).

use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::BrokerError;

use super::AppState;

/// Constant-time string comparison to avoid leaking token length/prefix via
/// timing.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Validate a `Bearer` token from HTTP headers. `Ok(())` when `expected` is
/// `None` (auth disabled, `--insecure`) or the header matches.
pub fn validate_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), BrokerError> {
    let expected = match expected {
        Some(tok) => tok,
        None => return Ok(()),
    };

    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(BrokerError::unauthorized)?;

    let token = header.strip_prefix("Bearer ").ok_or_else(BrokerError::unauthorized)?;
    if constant_time_eq(token, expected) {
        Ok(())
    } else {
        Err(BrokerError::unauthorized())
    }
}

/// Paths that skip the bearer check: health so orchestrators can probe
/// liveness without a token, and the WS upgrade, whose browser-side
/// `EventSource`/`WebSocket` clients can't set an `Authorization` header.
fn is_exempt(path: &str) -> bool {
    path == "/api/v1/health" || path == "/ws/events"
}

/// Axum middleware enforcing bearer auth on every route except [`is_exempt`]
/// paths. A `None` `auth_token` on `AppState` (i.e. `--insecure`) disables
/// the check entirely.
pub async fn auth_layer(State(state): State<AppState>, req: Request<axum::body::Body>, next: Next) -> Response {
    if is_exempt(req.uri().path()) {
        return next.run(req).await;
    }

    if let Err(err) = validate_bearer(req.headers(), state.auth_token.as_deref()) {
        let status = StatusCode::from_u16(err.kind.http_status()).unwrap_or(StatusCode::UNAUTHORIZED);
        let body = axum::Json(serde_json::json!({"error": err.kind.as_str(), "detail": err.detail}));
        return (status, body).into_response();
    }

    next.run(req).await
}
