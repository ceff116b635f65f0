// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Parsed in-band command types (§3, §4.3).
//!
//! These are what the Protocol Parser (C4) produces and what the Delivery
//! Planner (C5) and Broker Core (C9) consume. Parsing is pure; a `Target`
//! is resolved against the routing table later, never here.

use std::fmt;
use std::time::Duration;

/// A delivery target as written in a `TO` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    AgentName(String),
    Channel(String),
    Broadcast,
    Bridge { project: String, name: String },
}

impl Target {
    /// Parse the raw (already-trimmed) `TO` header value.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if raw == "*" {
            return Some(Self::Broadcast);
        }
        if let Some(channel) = raw.strip_prefix('#') {
            if channel.is_empty() {
                return None;
            }
            return Some(Self::Channel(channel.to_string()));
        }
        if let Some((project, name)) = raw.split_once(':') {
            if project.is_empty() || name.is_empty() {
                return None;
            }
            return Some(Self::Bridge { project: project.to_string(), name: name.to_string() });
        }
        Some(Self::AgentName(raw.to_string()))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AgentName(name) => write!(f, "{name}"),
            Self::Channel(name) => write!(f, "#{name}"),
            Self::Broadcast => write!(f, "*"),
            Self::Bridge { project, name } => write!(f, "{project}:{name}"),
        }
    }
}

/// The kind tag on a `message` command, carried through to the injected
/// envelope but otherwise opaque to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MessageKind {
    #[default]
    Message,
    Other(String),
}

impl MessageKind {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") | Some("message") => Self::Message,
            Some(other) => Self::Other(other.to_lowercase()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlKind {
    Ping,
    Status,
}

/// A fully parsed in-band command, ready for the planner or the broker core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCommand {
    Message {
        to: Target,
        thread: Option<String>,
        kind: MessageKind,
        body: String,
        /// `Some(duration)` when the sender set `AWAIT` with an explicit
        /// duration; that duration bounds how long the delivery may sit
        /// `injected` before it fails with `timeout` (§4.6 strategy c).
        /// `None` means the delivery settles under the ordinary grace
        /// window instead, falling back to `uncertain` rather than failing.
        await_timeout: Option<Duration>,
    },
    Spawn {
        name: String,
        cli: String,
        task: String,
        channels: Vec<String>,
        cwd: Option<String>,
    },
    Release {
        name: String,
        reason: Option<String>,
    },
    /// An in-band acknowledgement of a prior delivery, referencing its
    /// `delivery_id` (§4.6 strategy a).
    Ack {
        delivery_id: String,
    },
    Control(ControlKind),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_target() {
        assert_eq!(Target::parse("*"), Some(Target::Broadcast));
    }

    #[test]
    fn channel_target() {
        assert_eq!(Target::parse("#team"), Some(Target::Channel("team".into())));
    }

    #[test]
    fn bridge_target() {
        assert_eq!(
            Target::parse("project:name"),
            Some(Target::Bridge { project: "project".into(), name: "name".into() })
        );
    }

    #[test]
    fn plain_name_target() {
        assert_eq!(Target::parse("Alice"), Some(Target::AgentName("Alice".into())));
    }

    #[test]
    fn trailing_whitespace_trimmed() {
        assert_eq!(Target::parse("Alice  "), Some(Target::AgentName("Alice".into())));
    }

    #[test]
    fn empty_target_rejected() {
        assert_eq!(Target::parse(""), None);
        assert_eq!(Target::parse("#"), None);
    }

    #[test]
    fn message_kind_defaults_to_message() {
        assert_eq!(MessageKind::parse(None), MessageKind::Message);
        assert_eq!(MessageKind::parse(Some("message")), MessageKind::Message);
        assert_eq!(MessageKind::parse(Some("Spawn")), MessageKind::Other("spawn".into()));
    }
}
