// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Injector (C6, §4.5). Renders a delivery's body inside the provenance
//! envelope and writes it to the target's PTY input.

use bytes::Bytes;
use tokio::sync::mpsc;

const REMINDER_OPEN: &str = "<system-reminder>";
const REMINDER_CLOSE: &str = "</system-reminder>";

/// Capability hint appended to the envelope for agents that understand an
/// MCP-style reply tool, vs. the plain in-band reply instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCapability {
    McpReply,
    InBandOnly,
}

fn hint_for(capability: ReplyCapability) -> &'static str {
    match capability {
        ReplyCapability::McpReply => "Reply with the relay_reply tool.",
        ReplyCapability::InBandOnly => {
            "Reply with a <<<RELAY ... RELAY>>> block addressed back to the sender."
        }
    }
}

/// Render the provenance-wrapped envelope for a message delivery (§4.5/§6).
/// If `body` already begins with the reminder tag, it is passed through
/// unchanged to avoid double-wrapping.
pub fn render_envelope(
    sender: &str,
    delivery_id: &str,
    channel: Option<&str>,
    body: &str,
    capability: ReplyCapability,
) -> String {
    if body.trim_start().starts_with(REMINDER_OPEN) {
        return format!("{body}\n");
    }

    let channel_suffix = channel.map(|c| format!(" [#{c}]")).unwrap_or_default();
    let hint = hint_for(capability);
    format!(
        "{REMINDER_OPEN}\nRelay message from {sender} [{delivery_id}]{channel_suffix}: {body}\n{hint}\n{REMINDER_CLOSE}\n"
    )
}

/// Outcome of an injection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectOutcome {
    Injected,
    Cancelled,
}

/// Write a rendered envelope to a session's input channel. Cancel-safe: if
/// the send is cancelled before completion, the caller observes
/// `Cancelled` rather than a corrupted partial write (the channel send
/// itself is atomic per message).
pub async fn inject(input_tx: &mpsc::Sender<Bytes>, rendered: String) -> InjectOutcome {
    match input_tx.send(Bytes::from(rendered.into_bytes())).await {
        Ok(()) => InjectOutcome::Injected,
        Err(_) => InjectOutcome::Cancelled,
    }
}
