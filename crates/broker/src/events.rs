// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The broker's single output event shape (§3, §4.7 of the design doc).
//!
//! Every subsystem that wants to tell the outside world something happened
//! constructs an [`EventKind`] and hands it to the sequencer; nothing else
//! produces events directly. `seq` is assigned by the sequencer, never by
//! the caller.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A terminal reason tag for a completed delivery (closed set, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    VerifiedAck,
    VerifiedRead,
    FailedTimeout,
    FailedWrite,
    FailedNoRoute,
    FailedCancelled,
    UncertainNoSignal,
}

impl TerminalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VerifiedAck => "verified.ack",
            Self::VerifiedRead => "verified.read",
            Self::FailedTimeout => "failed.timeout",
            Self::FailedWrite => "failed.write",
            Self::FailedNoRoute => "failed.no_route",
            Self::FailedCancelled => "failed.cancelled",
            Self::UncertainNoSignal => "uncertain.no_signal",
        }
    }
}

/// Worker presence signal (§5). Readers never emit these; only the broker
/// core does, derived from PTY activity thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    Online,
    Stuck,
}

/// Tagged event payload. One variant per kind in §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    AgentSpawned { agent_name: String, cli: String },
    AgentReady { agent_name: String },
    AgentExited { agent_name: String, cause: Option<String> },
    AgentReleased { agent_name: String, reason: Option<String> },
    DeliveryQueued { delivery_id: String, from: String, to: String },
    DeliveryInjected { delivery_id: String },
    DeliveryVerified { delivery_id: String, reason: TerminalReason },
    DeliveryFailed { delivery_id: String, reason: TerminalReason },
    DeliveryUncertain { delivery_id: String, reason: TerminalReason },
    InboundRelay { event_id: String, from: String, to: String },
    ReplayGap { since_seq: u64, oldest_available: u64 },
    Presence { agent_name: String, state: PresenceState },
    ParseError { agent_name: Option<String>, reason: String },
}

impl EventKind {
    /// The `agent_name` correlation key, when this kind carries one.
    pub fn agent_name(&self) -> Option<&str> {
        match self {
            Self::AgentSpawned { agent_name, .. }
            | Self::AgentReady { agent_name }
            | Self::AgentExited { agent_name, .. }
            | Self::AgentReleased { agent_name, .. }
            | Self::Presence { agent_name, .. } => Some(agent_name),
            Self::ParseError { agent_name, .. } => agent_name.as_deref(),
            _ => None,
        }
    }

    /// The `delivery_id` correlation key, when this kind carries one.
    pub fn delivery_id(&self) -> Option<&str> {
        match self {
            Self::DeliveryQueued { delivery_id, .. }
            | Self::DeliveryInjected { delivery_id }
            | Self::DeliveryVerified { delivery_id, .. }
            | Self::DeliveryFailed { delivery_id, .. }
            | Self::DeliveryUncertain { delivery_id, .. } => Some(delivery_id),
            _ => None,
        }
    }
}

/// A single broker event, as carried over the replay ring and the `/ws/events`
/// surface. `seq` is strictly increasing and never reused within a broker
/// process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub ts_millis: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    /// Construct an event with the current wall-clock timestamp. `seq` must
    /// still be assigned by the sequencer before this is observable outside
    /// the broker core.
    pub fn now(seq: u64, kind: EventKind) -> Self {
        let ts_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self { seq, ts_millis, kind }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_keys_extracted() {
        let kind = EventKind::DeliveryQueued {
            delivery_id: "d1".into(),
            from: "Alice".into(),
            to: "Bob".into(),
        };
        assert_eq!(kind.delivery_id(), Some("d1"));
        assert_eq!(kind.agent_name(), None);
    }

    #[test]
    fn serializes_with_tag() {
        let evt = Event::now(1, EventKind::AgentReady { agent_name: "Alice".into() });
        let json = serde_json::to_value(&evt).expect("serialize");
        assert_eq!(json["kind"], "agent_ready");
        assert_eq!(json["seq"], 1);
    }
}
