// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Identity / Routing Table (C1).
//!
//! Canonical agent registry plus channel membership. Reads are served from
//! an immutable snapshot (§5: "Routing Table is read-mostly, copy-on-write
//! snapshots suffice"); only the Broker Core mutates it, via `register`,
//! `remove`, and `join_channel`.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use tokio::sync::RwLock;

use crate::agent::{Agent, AgentLifecycle};
use crate::error::BrokerError;

/// Immutable point-in-time view of the routing table, used by the Delivery
/// Planner (C5), which must be pure and side-effect free.
#[derive(Debug, Clone, Default)]
pub struct RoutingSnapshot {
    agents: Arc<IndexMap<String, Agent>>,
    channels: Arc<IndexMap<String, IndexSet<String>>>,
}

impl RoutingSnapshot {
    pub fn get(&self, name: &str) -> Option<&Agent> {
        self.agents.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// All live worker agents, in insertion order, optionally excluding one name.
    pub fn live_workers_excluding<'a>(&'a self, exclude: &'a str) -> impl Iterator<Item = &'a Agent> + 'a {
        self.agents
            .values()
            .filter(move |a| a.lifecycle.is_live() && a.name != exclude)
    }

    /// Members of `channel`, in insertion order, excluding `exclude`.
    pub fn channel_members_excluding<'a>(
        &'a self,
        channel: &str,
        exclude: &'a str,
    ) -> Vec<&'a Agent> {
        let Some(members) = self.channels.get(channel) else {
            return Vec::new();
        };
        members
            .iter()
            .filter(|name| name.as_str() != exclude)
            .filter_map(|name| self.agents.get(name))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }
}

/// Owning registry. All mutation flows through the Broker Core (C9); readers
/// take a cheap `Arc`-backed [`RoutingSnapshot`] clone.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<RoutingSnapshot>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> RoutingSnapshot {
        self.inner.read().await.clone()
    }

    /// Register a newly spawned agent. Errs with `NameConflict` if a live
    /// incarnation of `name` already exists.
    pub async fn register(&self, agent: Agent) -> Result<(), BrokerError> {
        let mut guard = self.inner.write().await;
        if let Some(existing) = guard.agents.get(&agent.name) {
            if existing.lifecycle.is_live() {
                return Err(BrokerError::name_conflict(&agent.name));
            }
        }

        let channels = Arc::make_mut(&mut guard.channels);
        for channel in &agent.channels {
            channels.entry(channel.clone()).or_default().insert(agent.name.clone());
        }
        let agents = Arc::make_mut(&mut guard.agents);
        agents.insert(agent.name.clone(), agent);
        Ok(())
    }

    pub async fn set_lifecycle(&self, name: &str, lifecycle: AgentLifecycle) -> Result<(), BrokerError> {
        let mut guard = self.inner.write().await;
        let agents = Arc::make_mut(&mut guard.agents);
        let agent = agents.get_mut(name).ok_or_else(|| BrokerError::unknown_agent(name))?;
        agent.lifecycle = lifecycle;
        Ok(())
    }

    pub async fn touch(&self, name: &str) {
        let mut guard = self.inner.write().await;
        let agents = Arc::make_mut(&mut guard.agents);
        if let Some(agent) = agents.get_mut(name) {
            agent.touch();
        }
    }

    /// Mark `name` released/exited. The incarnation stays in the table
    /// (terminal state is permanent, §3) but is dropped from channels so it
    /// no longer receives fan-out deliveries.
    pub async fn retire(&self, name: &str, lifecycle: AgentLifecycle) -> Result<(), BrokerError> {
        let mut guard = self.inner.write().await;
        let agents = Arc::make_mut(&mut guard.agents);
        let agent = agents.get_mut(name).ok_or_else(|| BrokerError::unknown_agent(name))?;
        agent.lifecycle = lifecycle;
        let channels = Arc::make_mut(&mut guard.channels);
        for members in channels.values_mut() {
            members.shift_remove(name);
        }
        Ok(())
    }
}
