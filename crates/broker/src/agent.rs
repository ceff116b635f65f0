// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent data model (§3): identity, role, channel membership, and the
//! lifecycle an incarnation moves through from spawn to exit.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::injector::ReplyCapability;

/// An agent's role in the routing graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Worker,
    Broker,
    Reader,
}

/// Lifecycle state of an agent incarnation. Terminal state (`Exited`) is
/// permanent: a name that has exited must be re-spawned as a new
/// incarnation, never resurrected in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentLifecycle {
    Announced,
    Spawning,
    Ready,
    Idle,
    Busy,
    Releasing,
    Exited,
}

impl AgentLifecycle {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited)
    }

    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Exited | Self::Releasing)
    }
}

/// A managed agent: its identity, role, channel membership, and lifecycle.
///
/// The PTY session itself (process handle, master fd) is owned separately
/// by [`crate::pty::PtySession`]; `Agent` is the routing-table-facing
/// identity record.
#[derive(Debug, Clone)]
pub struct Agent {
    pub name: String,
    pub role: Role,
    pub cli: String,
    pub channels: Vec<String>,
    pub bridge_project: Option<String>,
    pub lifecycle: AgentLifecycle,
    pub last_activity: Instant,
    pub capability: ReplyCapability,
}

impl Agent {
    pub fn new(name: impl Into<String>, cli: impl Into<String>, channels: Vec<String>) -> Self {
        Self {
            name: name.into(),
            role: Role::Worker,
            cli: cli.into(),
            channels,
            bridge_project: None,
            lifecycle: AgentLifecycle::Announced,
            last_activity: Instant::now(),
            capability: ReplyCapability::InBandOnly,
        }
    }

    /// Declare this incarnation understands the MCP-style reply tool,
    /// changing the hint the injector appends to delivered envelopes (§4.5).
    pub fn with_capability(mut self, capability: ReplyCapability) -> Self {
        self.capability = capability;
        self
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn in_channel(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c == channel)
    }
}

/// Serializable snapshot of an agent for `list_agents` and the transport
/// surface. Does not carry OS-level handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub name: String,
    pub role: Role,
    pub cli: String,
    pub channels: Vec<String>,
    pub lifecycle: AgentLifecycle,
    pub idle_secs: u64,
}

impl From<&Agent> for AgentSnapshot {
    fn from(agent: &Agent) -> Self {
        Self {
            name: agent.name.clone(),
            role: agent.role,
            cli: agent.cli.clone(),
            channels: agent.channels.clone(),
            lifecycle: agent.lifecycle,
            idle_secs: agent.last_activity.elapsed().as_secs(),
        }
    }
}
