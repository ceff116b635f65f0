// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `/ws/events` (§4.9): upgrades to a WebSocket and streams
//! `subscribe_events(since_seq)` as one JSON-encoded [`Event`] per frame.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tracing::debug;

use super::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws/events", get(events))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    since_seq: u64,
}

async fn events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_events(socket, state, query.since_seq))
}

async fn stream_events(mut socket: WebSocket, state: AppState, since_seq: u64) {
    let (replay, mut live, cutoff) = state.broker.subscribe_events(since_seq).await;

    for event in replay {
        let Ok(payload) = serde_json::to_string(&event) else { continue };
        if socket.send(Message::Text(payload.into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Err(err)) => {
                        debug!(error = %err, "ws/events client read error");
                        return;
                    }
                    _ => {}
                }
            }
            event = live.recv() => {
                match event {
                    // Already covered by the replay scan above; sending it
                    // again would duplicate a delivery the client already saw.
                    Ok(event) if event.seq <= cutoff => continue,
                    Ok(event) => {
                        let Ok(payload) = serde_json::to_string(&event) else { continue };
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}
