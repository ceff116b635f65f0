// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! External bus collaborator interface (§6) and the self-echo/dedup logic
//! that sits in front of it (§4.8, §8 property 5).
//!
//! The bus itself (the hosted relay service) is out of scope and treated as
//! an opaque three-operation interface: `send`, `subscribe`, `heartbeat`.
//! `subscribe` is modeled as the broker core holding the receiving half of
//! an `mpsc` channel rather than as a trait method, since a `Stream` isn't
//! object-safe without extra machinery this broker doesn't otherwise need.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::events::PresenceState;

/// A message the broker hands to the external bus after a local delivery.
#[derive(Debug, Clone)]
pub struct OutboundEnvelope {
    pub delivery_id: String,
    pub from: String,
    pub to: String,
    pub body: String,
}

/// A normalized inbound event, after tolerating both top-level and
/// payload-wrapped shapes from the bus (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub event_id: String,
    pub from: String,
    pub to: String,
    pub body: String,
}

/// Raw shapes the bus may hand us. Both are accepted; payload-wrapped takes
/// precedence when both `body` and `payload.body` could apply is
/// unambiguous because only one key is ever present in practice.
#[derive(Debug, Deserialize)]
struct TopLevelShape {
    event_id: String,
    from: String,
    to: String,
    body: String,
}

#[derive(Debug, Deserialize)]
struct PayloadWrapperShape {
    event_id: String,
    from: String,
    to: String,
    payload: PayloadBody,
}

#[derive(Debug, Deserialize)]
struct PayloadBody {
    body: String,
}

/// Normalize a raw inbound JSON value into an [`InboundEvent`]. Unknown
/// fields are ignored; a value matching neither known shape is `Malformed`.
pub fn normalize_inbound(raw: &serde_json::Value) -> Result<InboundEvent, crate::error::BrokerError> {
    if let Ok(wrapped) = serde_json::from_value::<PayloadWrapperShape>(raw.clone()) {
        return Ok(InboundEvent {
            event_id: wrapped.event_id,
            from: wrapped.from,
            to: wrapped.to,
            body: wrapped.payload.body,
        });
    }
    if let Ok(top) = serde_json::from_value::<TopLevelShape>(raw.clone()) {
        return Ok(InboundEvent { event_id: top.event_id, from: top.from, to: top.to, body: top.body });
    }
    Err(crate::error::BrokerError::new(
        crate::error::ErrorKind::Malformed,
        "inbound event matches neither top-level nor payload-wrapped shape",
    ))
}

/// The three operations the broker requires from the external bus (§6).
pub trait ExternalBus: Send + Sync {
    fn send(
        &self,
        envelope: OutboundEnvelope,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>>;

    fn heartbeat(
        &self,
        agent: &str,
        state: PresenceState,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}

/// Sliding-window suppression of bus echoes of our own outbound deliveries
/// (§4.8, §8 property 5). Fingerprint is sender+body, bucketed by a coarse
/// time window so minor clock skew between broker and bus still matches.
pub struct EchoSuppressor {
    window: Duration,
    sent: VecDeque<(String, Instant)>,
}

impl EchoSuppressor {
    pub fn new(window: Duration) -> Self {
        Self { window, sent: VecDeque::new() }
    }

    fn fingerprint(sender: &str, body: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(sender.as_bytes());
        hasher.update(b"\0");
        hasher.update(body.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Record that we just sent `body` as `sender`, for later echo matching.
    pub fn record_outbound(&mut self, sender: &str, body: &str) {
        self.evict_expired();
        self.sent.push_back((Self::fingerprint(sender, body), Instant::now()));
    }

    /// True if an inbound event from `sender` with `body` matches a recent
    /// outbound send and should be suppressed as a bus echo.
    pub fn is_echo(&mut self, sender: &str, body: &str) -> bool {
        self.evict_expired();
        let fp = Self::fingerprint(sender, body);
        self.sent.iter().any(|(seen, _)| *seen == fp)
    }

    fn evict_expired(&mut self) {
        let cutoff = Instant::now();
        while let Some((_, ts)) = self.sent.front() {
            if cutoff.duration_since(*ts) > self.window {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Sliding-window dedup of inbound `event_id`s (§4.8: "duplicates within a
/// sliding window are dropped").
pub struct InboundDedup {
    window: Duration,
    seen: VecDeque<(String, Instant)>,
}

impl InboundDedup {
    pub fn new(window: Duration) -> Self {
        Self { window, seen: VecDeque::new() }
    }

    /// Returns true if `event_id` was already seen within the window (and
    /// should be dropped); otherwise records it and returns false.
    pub fn check_and_record(&mut self, event_id: &str) -> bool {
        self.evict_expired();
        if self.seen.iter().any(|(id, _)| id == event_id) {
            return true;
        }
        self.seen.push_back((event_id.to_string(), Instant::now()));
        false
    }

    fn evict_expired(&mut self) {
        let cutoff = Instant::now();
        while let Some((_, ts)) = self.seen.front() {
            if cutoff.duration_since(*ts) > self.window {
                self.seen.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Serializable heartbeat payload (for a local fake bus / tests).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub agent: String,
    pub state: PresenceState,
}
