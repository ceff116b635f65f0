// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Transport Surface (C10, §4.9): a thin HTTP + WebSocket façade over the
//! Broker Core's operations, for dashboards/SDKs and this repository's own
//! integration tests.

mod auth;
mod http;
mod ws;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::broker::Broker;

/// Startup state reported on `/api/v1/ready` (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyState {
    Ready,
    ReadyDegradedRateLimited,
    Fatal,
}

/// Shared state threaded through every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub auth_token: Option<Arc<str>>,
    degraded: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(broker: Arc<Broker>, auth_token: Option<String>) -> Self {
        Self { broker, auth_token: auth_token.map(Arc::from), degraded: Arc::new(AtomicBool::new(false)) }
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Relaxed);
    }

    pub fn ready_state(&self) -> ReadyState {
        if self.degraded.load(Ordering::Relaxed) {
            ReadyState::ReadyDegradedRateLimited
        } else {
            ReadyState::Ready
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(http::router())
        .merge(ws::router())
        .layer(axum::middleware::from_fn_with_state(state.clone(), auth::auth_layer))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
