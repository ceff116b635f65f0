// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lifecycle Tracker (C7, §4.6). A concurrent map from `delivery_id` to its
//! state machine. Enforces: exactly one terminal transition per id, and
//! transitions only ever move forward (`Accepted -> Queued -> Injected ->
//! terminal`).

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::events::TerminalReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Accepted,
    Queued,
    Injected,
    Terminal(TerminalReason),
}

impl LifecycleState {
    fn rank(&self) -> u8 {
        match self {
            Self::Accepted => 0,
            Self::Queued => 1,
            Self::Injected => 2,
            Self::Terminal(_) => 3,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }
}

/// A transition attempt that violates the state machine. The caller should
/// treat this as a bug upstream and surface a `parse_error`-style event
/// rather than panicking (§4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalTransition {
    pub delivery_id: String,
    pub from: LifecycleState,
    pub attempted: LifecycleState,
}

pub struct LifecycleTracker {
    states: RwLock<HashMap<String, LifecycleState>>,
}

impl Default for LifecycleTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleTracker {
    pub fn new() -> Self {
        Self { states: RwLock::new(HashMap::new()) }
    }

    pub async fn accept(&self, delivery_id: impl Into<String>) {
        self.states.write().await.insert(delivery_id.into(), LifecycleState::Accepted);
    }

    pub async fn get(&self, delivery_id: &str) -> Option<LifecycleState> {
        self.states.read().await.get(delivery_id).copied()
    }

    /// Attempt a transition. Rejects out-of-order moves and any transition
    /// out of an already-terminal state.
    pub async fn transition(
        &self,
        delivery_id: &str,
        next: LifecycleState,
    ) -> Result<LifecycleState, IllegalTransition> {
        let mut guard = self.states.write().await;
        let current = guard.get(delivery_id).copied().unwrap_or(LifecycleState::Accepted);

        let legal = !current.is_terminal() && next.rank() == current.rank() + 1;
        if !legal {
            return Err(IllegalTransition { delivery_id: delivery_id.to_string(), from: current, attempted: next });
        }
        guard.insert(delivery_id.to_string(), next);
        Ok(next)
    }

    pub async fn queued(&self, delivery_id: &str) -> Result<LifecycleState, IllegalTransition> {
        self.transition(delivery_id, LifecycleState::Queued).await
    }

    pub async fn injected(&self, delivery_id: &str) -> Result<LifecycleState, IllegalTransition> {
        self.transition(delivery_id, LifecycleState::Injected).await
    }

    pub async fn terminal(
        &self,
        delivery_id: &str,
        reason: TerminalReason,
    ) -> Result<LifecycleState, IllegalTransition> {
        self.transition(delivery_id, LifecycleState::Terminal(reason)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_happy_path() {
        let tracker = LifecycleTracker::new();
        tracker.accept("d1").await;
        tracker.queued("d1").await.unwrap();
        tracker.injected("d1").await.unwrap();
        let state = tracker.terminal("d1", TerminalReason::VerifiedAck).await.unwrap();
        assert_eq!(state, LifecycleState::Terminal(TerminalReason::VerifiedAck));
    }

    #[tokio::test]
    async fn out_of_order_transition_rejected() {
        let tracker = LifecycleTracker::new();
        tracker.accept("d1").await;
        let err = tracker.injected("d1").await.unwrap_err();
        assert_eq!(err.from, LifecycleState::Accepted);
    }

    #[tokio::test]
    async fn exactly_one_terminal_transition() {
        let tracker = LifecycleTracker::new();
        tracker.accept("d1").await;
        tracker.queued("d1").await.unwrap();
        tracker.injected("d1").await.unwrap();
        tracker.terminal("d1", TerminalReason::VerifiedAck).await.unwrap();

        let err = tracker.terminal("d1", TerminalReason::FailedTimeout).await.unwrap_err();
        assert!(err.from.is_terminal());
    }
}
