// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-agent wiring: owns the PTY backend task and the reader task that
//! drives bytes through the [`Normalizer`](crate::normalizer::Normalizer)
//! and [`Parser`](crate::protocol::Parser) into [`ParsedCommand`]s.
//!
//! One task per PTY reader, one writer serializer per session (§5, §9):
//! the backend's `run()` task *is* the writer serializer (it owns the fd
//! exclusively and drains `input_rx` sequentially), and the reader task
//! spawned alongside it is the sole consumer of that session's output.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::command::ParsedCommand;
use crate::normalizer::Normalizer;
use crate::protocol::{Outcome, Parser};
use crate::pty::{Backend, ExitStatus};

/// A command parsed out of one agent's output stream, tagged with its
/// source so the broker core can plan delivery or dispatch lifecycle
/// commands against it.
#[derive(Debug, Clone)]
pub struct FromAgent {
    pub agent_name: String,
    pub command: ParsedCommand,
}

/// A parse failure from one agent's output stream (§4.3: never desyncs the
/// parser permanently, but still worth surfacing as a `parse_error` event).
#[derive(Debug, Clone)]
pub struct AgentParseError {
    pub agent_name: String,
    pub reason: String,
}

/// Everything the broker core needs to address a live session: a sender for
/// raw bytes and a handle to await/abort the backend task.
pub struct SessionHandle {
    pub input_tx: mpsc::Sender<Bytes>,
    pub backend_task: JoinHandle<anyhow::Result<ExitStatus>>,
}

impl SessionHandle {
    pub fn child_exited(&self) -> bool {
        self.backend_task.is_finished()
    }
}

/// Spawn the backend and reader tasks for one agent. Parsed commands and
/// parse errors are forwarded to `commands_tx`/`errors_tx` respectively; the
/// broker core owns the receiving ends and fans them into its dispatch
/// loop alongside external-bus ingestion.
pub fn spawn_session(
    agent_name: String,
    mut backend: Box<dyn Backend>,
    commands_tx: mpsc::Sender<FromAgent>,
    errors_tx: mpsc::Sender<AgentParseError>,
) -> SessionHandle {
    let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(256);
    let (input_tx, input_rx) = mpsc::channel::<Bytes>(256);

    let backend_task = tokio::spawn(async move { backend.run(output_tx, input_rx).await });

    let reader_name = agent_name.clone();
    tokio::spawn(async move {
        let mut normalizer = Normalizer::new();
        let mut parser = Parser::new();

        while let Some(chunk) = output_rx.recv().await {
            for line in normalizer.feed(&chunk) {
                for outcome in parser.feed_line(&line) {
                    dispatch_outcome(&reader_name, outcome, &commands_tx, &errors_tx).await;
                }
            }
        }

        if let Some(outcome) = parser.flush() {
            dispatch_outcome(&reader_name, outcome, &commands_tx, &errors_tx).await;
        }
        debug!(agent = %reader_name, "session reader exiting: pty output closed");
    });

    SessionHandle { input_tx, backend_task }
}

async fn dispatch_outcome(
    agent_name: &str,
    outcome: Outcome,
    commands_tx: &mpsc::Sender<FromAgent>,
    errors_tx: &mpsc::Sender<AgentParseError>,
) {
    match outcome {
        Outcome::Command(command) => {
            if commands_tx.send(FromAgent { agent_name: agent_name.to_string(), command }).await.is_err() {
                warn!(agent = agent_name, "dropping parsed command: broker core channel closed");
            }
        }
        Outcome::Error(err) => {
            if errors_tx
                .send(AgentParseError { agent_name: agent_name.to_string(), reason: err.reason })
                .await
                .is_err()
            {
                warn!(agent = agent_name, "dropping parse error: broker core channel closed");
            }
        }
    }
}
