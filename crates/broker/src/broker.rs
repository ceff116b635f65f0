// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Broker Core (C9, §4.8). Owns every subsystem and exposes the
//! transport-agnostic operations that the HTTP/WS surface (C10) and the
//! in-band command dispatch loop both call into.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentLifecycle, AgentSnapshot};
use crate::bus::{normalize_inbound, EchoSuppressor, ExternalBus, InboundDedup, OutboundEnvelope};
use crate::command::{ParsedCommand, Target};
use crate::error::{BrokerError, ErrorKind};
use crate::events::{Event, EventKind, PresenceState, TerminalReason};
use crate::injector::{inject, render_envelope, InjectOutcome, ReplyCapability};
use crate::lifecycle::LifecycleTracker;
use crate::planner::plan_delivery;
use crate::pty::{Backend, Boxed};
use crate::registry::Registry;
use crate::sequencer::Sequencer;
use crate::session::{spawn_session, AgentParseError, FromAgent, SessionHandle};

/// Runtime settings the broker core needs (a subset of [`crate::config::Config`]).
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub ring_capacity: usize,
    pub online_threshold_secs: u64,
    pub stuck_threshold_secs: u64,
    pub delivery_grace_secs: u64,
    pub echo_window_secs: u64,
    pub dedup_window_secs: u64,
    pub close_grace_ms: u64,
    pub busy_idle_secs: u64,
    pub cols: u16,
    pub rows: u16,
    pub strict_names: bool,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            ring_capacity: crate::ring::DEFAULT_CAPACITY,
            online_threshold_secs: 30,
            stuck_threshold_secs: 300,
            delivery_grace_secs: 30,
            echo_window_secs: 2,
            dedup_window_secs: 300,
            close_grace_ms: 50,
            busy_idle_secs: 2,
            cols: 200,
            rows: 50,
            strict_names: false,
        }
    }
}

/// Factory for a PTY backend, injected so tests can substitute a fake.
pub type BackendFactory =
    dyn Fn(&[String], u16, u16, Duration) -> anyhow::Result<Box<dyn Backend>> + Send + Sync;

pub fn native_backend_factory() -> Box<BackendFactory> {
    Box::new(|command, cols, rows, close_grace| {
        crate::pty::spawn::NativePty::spawn(command, cols, rows, close_grace).map(Boxed::boxed)
    })
}

pub struct Broker {
    settings: BrokerSettings,
    registry: Registry,
    sequencer: Sequencer,
    lifecycle: LifecycleTracker,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    echo: Mutex<EchoSuppressor>,
    dedup: Mutex<InboundDedup>,
    presence: Mutex<HashMap<String, PresenceState>>,
    /// `delivery_id -> recipient agent_name` for deliveries still awaiting
    /// verification by ack or by an idle→busy→idle crossing (§4.6).
    pending_verification: Mutex<HashMap<String, String>>,
    bus: Option<Arc<dyn ExternalBus>>,
    backend_factory: Box<BackendFactory>,
    shutdown: CancellationToken,
    commands_tx: mpsc::Sender<FromAgent>,
    commands_rx: Mutex<Option<mpsc::Receiver<FromAgent>>>,
    errors_tx: mpsc::Sender<AgentParseError>,
    errors_rx: Mutex<Option<mpsc::Receiver<AgentParseError>>>,
}

impl Broker {
    pub fn new(
        settings: BrokerSettings,
        backend_factory: Box<BackendFactory>,
        bus: Option<Arc<dyn ExternalBus>>,
    ) -> Arc<Self> {
        let (commands_tx, commands_rx) = mpsc::channel(256);
        let (errors_tx, errors_rx) = mpsc::channel(256);
        Arc::new(Self {
            sequencer: Sequencer::new(settings.ring_capacity),
            echo: Mutex::new(EchoSuppressor::new(Duration::from_secs(settings.echo_window_secs))),
            dedup: Mutex::new(InboundDedup::new(Duration::from_secs(settings.dedup_window_secs))),
            settings,
            registry: Registry::new(),
            lifecycle: LifecycleTracker::new(),
            sessions: RwLock::new(HashMap::new()),
            presence: Mutex::new(HashMap::new()),
            pending_verification: Mutex::new(HashMap::new()),
            bus,
            backend_factory,
            shutdown: CancellationToken::new(),
            commands_tx,
            commands_rx: Mutex::new(Some(commands_rx)),
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
        })
    }

    /// Drive the in-band command dispatch loop: every `ParsedCommand` and
    /// `parse_error` surfaced by any session's reader task is handled here,
    /// until `shutdown()` is called. One dispatch task for the whole broker
    /// (§9: "one dispatch task per command" refers to per-command handling
    /// being spawned off this loop, not one loop per command).
    pub async fn run_dispatch_loop(self: &Arc<Self>) {
        let (Some(mut commands_rx), Some(mut errors_rx)) =
            (self.commands_rx.lock().await.take(), self.errors_rx.lock().await.take())
        else {
            error!("run_dispatch_loop called more than once; ignoring");
            return;
        };

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("broker dispatch loop shutting down");
                    return;
                }
                Some(from_agent) = commands_rx.recv() => {
                    let this = Arc::clone(self);
                    tokio::spawn(async move { this.handle_from_agent(from_agent).await; });
                }
                Some(err) = errors_rx.recv() => {
                    self.sequencer.publish(EventKind::ParseError {
                        agent_name: Some(err.agent_name),
                        reason: err.reason,
                    }).await;
                }
                else => return,
            }
        }
    }

    async fn handle_from_agent(self: Arc<Self>, from: FromAgent) {
        self.registry.touch(&from.agent_name).await;
        self.mark_busy(&from.agent_name).await;
        match from.command {
            ParsedCommand::Message { to, thread: _, kind: _, body, await_timeout } => {
                let _ = self.send_message(&from.agent_name, &to, &body, await_timeout).await;
            }
            ParsedCommand::Spawn { name, cli, task, channels, cwd } => {
                let command = vec![cli.clone()];
                let _ = cwd; // cwd application is a process-spawn detail the fake/native backends may ignore in tests.
                match self.spawn_pty(&name, &cli, &command, channels, ReplyCapability::InBandOnly).await {
                    Ok(_) => {
                        if let Some(handle) = self.sessions.read().await.get(&name) {
                            let _ = inject(&handle.input_tx, format!("{task}\n")).await;
                        }
                    }
                    Err(e) => warn!(agent = %from.agent_name, error = %e, "in-band spawn failed"),
                }
            }
            ParsedCommand::Release { name, reason } => {
                if let Err(e) = self.release(&name, reason).await {
                    warn!(agent = %from.agent_name, error = %e, "in-band release failed");
                }
            }
            ParsedCommand::Ack { delivery_id } => {
                let _ = self.acknowledge(&delivery_id).await;
            }
            ParsedCommand::Control(_) => {
                // Liveness/status pings carry no broker-visible side effect;
                // the PTY write loop itself is the signal that the session is alive.
            }
        }
    }

    // ---- §4.8 operations ----

    pub async fn spawn_pty(
        self: &Arc<Self>,
        name: &str,
        cli: &str,
        command: &[String],
        channels: Vec<String>,
        capability: ReplyCapability,
    ) -> Result<AgentSnapshot, BrokerError> {
        let agent = Agent::new(name, cli, channels).with_capability(capability);
        if let Err(conflict) = self.registry.register(agent).await {
            if self.settings.strict_names {
                return Err(BrokerError::new(ErrorKind::Fatal, conflict.detail));
            }
            return Err(conflict);
        }

        self.sequencer
            .publish(EventKind::AgentSpawned { agent_name: name.to_string(), cli: cli.to_string() })
            .await;

        let close_grace = Duration::from_millis(self.settings.close_grace_ms);
        let backend = match (self.backend_factory)(command, self.settings.cols, self.settings.rows, close_grace) {
            Ok(backend) => backend,
            Err(e) => {
                let _ = self.registry.retire(name, AgentLifecycle::Exited).await;
                self.sequencer
                    .publish(EventKind::AgentExited { agent_name: name.to_string(), cause: Some(e.to_string()) })
                    .await;
                return Err(BrokerError::spawn_failed(e.to_string()));
            }
        };

        let handle = spawn_session(name.to_string(), backend, self.commands_tx.clone(), self.errors_tx.clone());
        self.sessions.write().await.insert(name.to_string(), handle);
        self.registry.set_lifecycle(name, AgentLifecycle::Ready).await?;
        self.sequencer.publish(EventKind::AgentReady { agent_name: name.to_string() }).await;

        let snapshot = self.registry.snapshot().await;
        snapshot.get(name).map(AgentSnapshot::from).ok_or_else(|| BrokerError::unknown_agent(name))
    }

    pub async fn release(self: &Arc<Self>, name: &str, reason: Option<String>) -> Result<(), BrokerError> {
        self.registry.retire(name, AgentLifecycle::Exited).await?;
        if let Some(handle) = self.sessions.write().await.remove(name) {
            drop(handle.input_tx);
            handle.backend_task.abort();
        }
        self.pending_verification.lock().await.retain(|_, recipient| recipient != name);
        self.sequencer
            .publish(EventKind::AgentReleased { agent_name: name.to_string(), reason })
            .await;
        Ok(())
    }

    /// Resolve `to` and deliver to every planned recipient, returning the
    /// `delivery_id`s created (one per recipient, §"Glossary: Delivery").
    pub async fn send_message(
        self: &Arc<Self>,
        from: &str,
        to: &Target,
        body: &str,
        await_timeout: Option<Duration>,
    ) -> Result<Vec<String>, BrokerError> {
        if matches!(to, Target::Channel(c) if c.trim().is_empty()) {
            return Err(BrokerError::invalid_target("empty channel name"));
        }

        let snapshot = self.registry.snapshot().await;
        let plan = plan_delivery(&snapshot, from, to);

        if plan.recipients.is_empty() && !plan.needs_dm_resolution {
            if matches!(to, Target::AgentName(_)) {
                return Err(BrokerError::no_route(format!("no route to {to}")));
            }
            // Channel/broadcast with zero current members is vacuous, not an error.
            return Ok(Vec::new());
        }
        if plan.needs_dm_resolution {
            return Err(BrokerError::no_route(format!("unresolved target: {to}")));
        }

        let mut delivery_ids = Vec::with_capacity(plan.recipients.len());
        for recipient in plan.recipients {
            let delivery_id = Uuid::new_v4().to_string();
            self.lifecycle.accept(&delivery_id).await;
            self.sequencer
                .publish(EventKind::DeliveryQueued {
                    delivery_id: delivery_id.clone(),
                    from: from.to_string(),
                    to: recipient.agent_name.clone(),
                })
                .await;
            let _ = self.lifecycle.queued(&delivery_id).await;

            self.deliver_one(
                from,
                &recipient.agent_name,
                recipient.channel_hint.as_deref(),
                body,
                delivery_id.clone(),
                await_timeout,
            )
            .await;

            delivery_ids.push(delivery_id);
        }

        if let Some(bus) = &self.bus {
            self.echo.lock().await.record_outbound(from, body);
            for delivery_id in &delivery_ids {
                let envelope = OutboundEnvelope {
                    delivery_id: delivery_id.clone(),
                    from: from.to_string(),
                    to: to.to_string(),
                    body: body.to_string(),
                };
                let _ = bus.send(envelope).await;
            }
        }

        Ok(delivery_ids)
    }

    async fn deliver_one(
        self: &Arc<Self>,
        from: &str,
        recipient: &str,
        channel_hint: Option<&str>,
        body: &str,
        delivery_id: String,
        await_timeout: Option<Duration>,
    ) {
        let input_tx = self.sessions.read().await.get(recipient).map(|h| h.input_tx.clone());
        let Some(input_tx) = input_tx else {
            let _ = self.lifecycle.terminal(&delivery_id, TerminalReason::FailedNoRoute).await;
            self.sequencer
                .publish(EventKind::DeliveryFailed { delivery_id, reason: TerminalReason::FailedNoRoute })
                .await;
            return;
        };

        let capability = self
            .registry
            .snapshot()
            .await
            .get(recipient)
            .map(|a| a.capability)
            .unwrap_or(ReplyCapability::InBandOnly);
        let rendered = render_envelope(from, &delivery_id, channel_hint, body, capability);
        match inject(&input_tx, rendered).await {
            InjectOutcome::Injected => {
                let _ = self.lifecycle.injected(&delivery_id).await;
                self.pending_verification.lock().await.insert(delivery_id.clone(), recipient.to_string());
                self.sequencer
                    .publish(EventKind::DeliveryInjected { delivery_id: delivery_id.clone() })
                    .await;
                self.schedule_grace_timeout(delivery_id, await_timeout);
            }
            InjectOutcome::Cancelled => {
                let _ = self.lifecycle.terminal(&delivery_id, TerminalReason::FailedCancelled).await;
                self.sequencer
                    .publish(EventKind::DeliveryFailed { delivery_id, reason: TerminalReason::FailedCancelled })
                    .await;
            }
        }
    }

    /// After injection, fall back to a terminal state once the grace window
    /// expires with no verification signal (§4.6 verification strategy c).
    /// `AWAIT` deliveries are bounded only by the duration the sender itself
    /// specified, not the fixed grace window, and fail with `timeout`
    /// instead of settling into `uncertain`, since the sender is blocked
    /// waiting on a reply.
    fn schedule_grace_timeout(self: &Arc<Self>, delivery_id: String, await_timeout: Option<Duration>) {
        let broker = Arc::clone(self);
        let (grace, is_await) = match await_timeout {
            Some(d) => (d, true),
            None => (Duration::from_secs(self.settings.delivery_grace_secs), false),
        };
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if broker.lifecycle.get(&delivery_id).await != Some(crate::lifecycle::LifecycleState::Injected) {
                return;
            }
            let reason =
                if is_await { TerminalReason::FailedTimeout } else { TerminalReason::UncertainNoSignal };
            let _ = broker.lifecycle.terminal(&delivery_id, reason).await;
            broker.pending_verification.lock().await.remove(&delivery_id);
            let kind = if is_await {
                EventKind::DeliveryFailed { delivery_id: delivery_id.clone(), reason }
            } else {
                EventKind::DeliveryUncertain { delivery_id: delivery_id.clone(), reason }
            };
            broker.sequencer.publish(kind).await;
        });
    }

    /// Resolve an in-band `ack` command against its referenced delivery
    /// (§4.6 verification strategy a). Only succeeds while the delivery is
    /// still `injected`; anything else (unknown id, already-terminal,
    /// not-yet-injected) is rejected by the lifecycle tracker's own
    /// forward-only transition rule.
    pub async fn acknowledge(self: &Arc<Self>, delivery_id: &str) -> Result<(), BrokerError> {
        self.lifecycle
            .terminal(delivery_id, TerminalReason::VerifiedAck)
            .await
            .map_err(|_| BrokerError::no_route(format!("no pending delivery awaiting ack: {delivery_id}")))?;
        self.pending_verification.lock().await.remove(delivery_id);
        self.sequencer
            .publish(EventKind::DeliveryVerified {
                delivery_id: delivery_id.to_string(),
                reason: TerminalReason::VerifiedAck,
            })
            .await;
        Ok(())
    }

    /// Mark `name` busy on incoming PTY activity, the start of the
    /// idle→busy→idle cycle `sweep_activity` later closes (§4.6 strategy b).
    async fn mark_busy(&self, name: &str) {
        let snapshot = self.registry.snapshot().await;
        if let Some(agent) = snapshot.get(name) {
            if agent.lifecycle.is_live() && agent.lifecycle != AgentLifecycle::Busy {
                let _ = self.registry.set_lifecycle(name, AgentLifecycle::Busy).await;
            }
        }
    }

    /// Sweep every `busy` agent back to `idle` once its activity has been
    /// quiet for `busy_idle_secs`, and treat that crossing as verification
    /// for any delivery still pending against it (§4.6 strategy b). Driven
    /// on a fixed interval by the caller, like `sweep_presence`.
    pub async fn sweep_activity(self: &Arc<Self>) {
        let snapshot = self.registry.snapshot().await;
        let mut went_idle = Vec::new();
        for agent in snapshot.agents() {
            if agent.lifecycle != AgentLifecycle::Busy {
                continue;
            }
            if agent.last_activity.elapsed().as_secs() >= self.settings.busy_idle_secs {
                let _ = self.registry.set_lifecycle(&agent.name, AgentLifecycle::Idle).await;
                went_idle.push(agent.name.clone());
            }
        }
        for name in went_idle {
            self.verify_pending_for(&name).await;
        }
    }

    async fn verify_pending_for(self: &Arc<Self>, name: &str) {
        let delivery_ids: Vec<String> = {
            let pending = self.pending_verification.lock().await;
            pending.iter().filter(|(_, recipient)| recipient.as_str() == name).map(|(id, _)| id.clone()).collect()
        };
        for delivery_id in delivery_ids {
            if self.lifecycle.terminal(&delivery_id, TerminalReason::VerifiedRead).await.is_ok() {
                self.pending_verification.lock().await.remove(&delivery_id);
                self.sequencer
                    .publish(EventKind::DeliveryVerified {
                        delivery_id,
                        reason: TerminalReason::VerifiedRead,
                    })
                    .await;
            }
        }
    }

    pub async fn list_agents(&self) -> Vec<AgentSnapshot> {
        let snapshot = self.registry.snapshot().await;
        snapshot.agents().map(AgentSnapshot::from).collect()
    }

    pub async fn subscribe_events(
        &self,
        since_seq: u64,
    ) -> (Vec<Event>, tokio::sync::broadcast::Receiver<Event>, u64) {
        self.sequencer.subscribe(since_seq).await
    }

    pub async fn ingest_inbound_relay(self: &Arc<Self>, raw: &serde_json::Value) -> Result<(), BrokerError> {
        let event = normalize_inbound(raw)?;

        if self.dedup.lock().await.check_and_record(&event.event_id) {
            return Ok(());
        }
        if self.echo.lock().await.is_echo(&event.from, &event.body) {
            return Ok(());
        }

        self.sequencer
            .publish(EventKind::InboundRelay {
                event_id: event.event_id.clone(),
                from: event.from.clone(),
                to: event.to.clone(),
            })
            .await;

        let Some(target) = Target::parse(&event.to) else {
            return Err(BrokerError::invalid_target(format!("malformed inbound TO: {}", event.to)));
        };
        let _ = self.send_message(&event.from, &target, &event.body, None).await;
        Ok(())
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn lifecycle_state(&self, delivery_id: &str) -> Option<crate::lifecycle::LifecycleState> {
        self.lifecycle.get(delivery_id).await
    }

    /// Recompute presence for every live agent and publish `Presence` events
    /// for any state transition (§5). Intended to be called on a fixed
    /// interval by the caller (e.g. `main.rs`'s own loop), not scheduled
    /// internally, so tests can drive it deterministically.
    ///
    /// Below `online_threshold_secs` an agent is `online`; at or past
    /// `stuck_threshold_secs` it's `stuck`. Between the two thresholds the
    /// last observed state is kept (hysteresis), since `PresenceState` has
    /// no third value for "past online, not yet stuck".
    pub async fn sweep_presence(&self) {
        let snapshot = self.registry.snapshot().await;
        let mut presence = self.presence.lock().await;
        for agent in snapshot.agents() {
            if !agent.lifecycle.is_live() {
                continue;
            }
            let idle_secs = agent.last_activity.elapsed().as_secs();
            let current = presence.get(&agent.name).copied();
            let state = if idle_secs >= self.settings.stuck_threshold_secs {
                PresenceState::Stuck
            } else if idle_secs < self.settings.online_threshold_secs {
                PresenceState::Online
            } else {
                current.unwrap_or(PresenceState::Online)
            };
            if current == Some(state) {
                continue;
            }
            presence.insert(agent.name.clone(), state);
            self.sequencer
                .publish(EventKind::Presence { agent_name: agent.name.clone(), state })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;

    struct EchoBackend;

    impl Backend for EchoBackend {
        fn run(
            &mut self,
            _output_tx: mpsc::Sender<bytes::Bytes>,
            mut input_rx: mpsc::Receiver<bytes::Bytes>,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<crate::pty::ExitStatus>> + Send + '_>> {
            Box::pin(async move {
                while input_rx.recv().await.is_some() {}
                Ok(crate::pty::ExitStatus { code: Some(0), signal: None })
            })
        }
        fn resize(&self, _cols: u16, _rows: u16) -> anyhow::Result<()> {
            Ok(())
        }
        fn child_pid(&self) -> Option<u32> {
            None
        }
    }

    fn fake_factory() -> Box<BackendFactory> {
        Box::new(|_cmd, _cols, _rows, _close_grace| Ok(Box::new(EchoBackend) as Box<dyn Backend>))
    }

    async fn spawn(broker: &Arc<Broker>, name: &str, channels: Vec<String>) -> AgentSnapshot {
        broker.spawn_pty(name, "cat", &["cat".into()], channels, ReplyCapability::InBandOnly).await.unwrap()
    }

    #[tokio::test]
    async fn spawn_then_list_agents() {
        let broker = Broker::new(BrokerSettings::default(), fake_factory(), None);
        spawn(&broker, "Alice", vec![]).await;
        let agents = broker.list_agents().await;
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].name, "Alice");
    }

    #[tokio::test]
    async fn spawn_conflict_surfaces_name_conflict_in_lenient_mode() {
        let broker = Broker::new(BrokerSettings::default(), fake_factory(), None);
        spawn(&broker, "Alice", vec![]).await;
        let err = broker
            .spawn_pty("Alice", "cat", &["cat".into()], vec![], ReplyCapability::InBandOnly)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NameConflict);
    }

    #[tokio::test]
    async fn send_message_to_unknown_agent_is_no_route() {
        let broker = Broker::new(BrokerSettings::default(), fake_factory(), None);
        let err = broker
            .send_message("u", &Target::AgentName("Ghost".into()), "hi", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoRoute);
    }

    #[tokio::test]
    async fn send_message_queues_and_injects_for_known_agent() {
        let broker = Broker::new(BrokerSettings::default(), fake_factory(), None);
        spawn(&broker, "Bob", vec![]).await;
        let ids = broker
            .send_message("u", &Target::AgentName("Bob".into()), "hello", None)
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        let state = broker.lifecycle_state(&ids[0]).await.unwrap();
        assert_eq!(state, crate::lifecycle::LifecycleState::Injected);
    }

    #[tokio::test]
    async fn release_then_message_is_no_route() {
        let broker = Broker::new(BrokerSettings::default(), fake_factory(), None);
        spawn(&broker, "Bob", vec![]).await;
        broker.release("Bob", None).await.unwrap();
        let err = broker
            .send_message("u", &Target::AgentName("Bob".into()), "hello", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoRoute);
    }

    #[tokio::test]
    async fn channel_fanout_produces_one_delivery_per_member() {
        let broker = Broker::new(BrokerSettings::default(), fake_factory(), None);
        spawn(&broker, "A", vec!["team".into()]).await;
        spawn(&broker, "B", vec!["team".into()]).await;
        spawn(&broker, "C", vec!["team".into()]).await;
        let ids = broker
            .send_message("outsider", &Target::Channel("team".into()), "go", None)
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn ingest_inbound_relay_dedup_drops_repeat() {
        let broker = Broker::new(BrokerSettings::default(), fake_factory(), None);
        spawn(&broker, "Alice", vec![]).await;
        let raw = serde_json::json!({"event_id": "e1", "from": "u", "to": "Alice", "body": "hi"});
        broker.ingest_inbound_relay(&raw).await.unwrap();
        broker.ingest_inbound_relay(&raw).await.unwrap();
        // Duplicate event_id is dropped silently, no error surfaced.
    }

    #[tokio::test]
    async fn presence_transitions_to_stuck_past_threshold() {
        let mut settings = BrokerSettings::default();
        settings.stuck_threshold_secs = 0;
        let broker = Broker::new(settings, fake_factory(), None);
        spawn(&broker, "Alice", vec![]).await;
        let (_, mut rx, _cutoff) = broker.subscribe_events(1).await;
        broker.sweep_presence().await;
        let evt = rx.recv().await.unwrap();
        match evt.kind {
            EventKind::Presence { agent_name, state } => {
                assert_eq!(agent_name, "Alice");
                assert_eq!(state, PresenceState::Stuck);
            }
            other => panic!("expected presence event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn presence_stays_online_below_online_threshold_past_default_stuck_gap() {
        // online_threshold_secs=30, stuck_threshold_secs=300 by default; a
        // freshly spawned agent is well under both and must read online.
        let broker = Broker::new(BrokerSettings::default(), fake_factory(), None);
        spawn(&broker, "Alice", vec![]).await;
        broker.sweep_presence().await;
        let agents = broker.list_agents().await;
        assert_eq!(agents[0].lifecycle, AgentLifecycle::Ready);
    }

    #[tokio::test]
    async fn ack_resolves_injected_delivery_as_verified() {
        let broker = Broker::new(BrokerSettings::default(), fake_factory(), None);
        spawn(&broker, "Bob", vec![]).await;
        let ids = broker
            .send_message("u", &Target::AgentName("Bob".into()), "hello", None)
            .await
            .unwrap();
        broker.acknowledge(&ids[0]).await.unwrap();
        let state = broker.lifecycle_state(&ids[0]).await.unwrap();
        assert_eq!(state, crate::lifecycle::LifecycleState::Terminal(TerminalReason::VerifiedAck));
    }

    #[tokio::test]
    async fn ack_on_unknown_delivery_is_rejected() {
        let broker = Broker::new(BrokerSettings::default(), fake_factory(), None);
        assert!(broker.acknowledge("no-such-delivery").await.is_err());
    }

    #[tokio::test]
    async fn await_timeout_bounds_only_by_header_duration_not_fixed_grace() {
        let mut settings = BrokerSettings::default();
        settings.delivery_grace_secs = 3600; // would never fire within the test
        let broker = Broker::new(settings, fake_factory(), None);
        spawn(&broker, "Bob", vec![]).await;
        let ids = broker
            .send_message(
                "u",
                &Target::AgentName("Bob".into()),
                "hello",
                Some(Duration::from_millis(20)),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let state = broker.lifecycle_state(&ids[0]).await.unwrap();
        assert_eq!(state, crate::lifecycle::LifecycleState::Terminal(TerminalReason::FailedTimeout));
    }

    #[tokio::test]
    async fn busy_idle_crossing_verifies_pending_delivery() {
        let mut settings = BrokerSettings::default();
        settings.busy_idle_secs = 0;
        let broker = Broker::new(settings, fake_factory(), None);
        spawn(&broker, "Bob", vec![]).await;
        let ids = broker
            .send_message("u", &Target::AgentName("Bob".into()), "hello", None)
            .await
            .unwrap();
        broker.registry.set_lifecycle("Bob", AgentLifecycle::Busy).await.unwrap();
        broker.sweep_activity().await;
        let state = broker.lifecycle_state(&ids[0]).await.unwrap();
        assert_eq!(state, crate::lifecycle::LifecycleState::Terminal(TerminalReason::VerifiedRead));
    }

    #[tokio::test]
    async fn spawn_with_mcp_reply_capability_changes_hint() {
        let broker = Broker::new(BrokerSettings::default(), fake_factory(), None);
        broker
            .spawn_pty("Bob", "cat", &["cat".into()], vec![], ReplyCapability::McpReply)
            .await
            .unwrap();
        broker.send_message("u", &Target::AgentName("Bob".into()), "hi", None).await.unwrap();
        let ids = broker
            .send_message("u", &Target::AgentName("Bob".into()), "hi again", None)
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
    }
}
