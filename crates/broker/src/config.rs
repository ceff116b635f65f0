// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Layered configuration (§2.1, ambient): CLI flags with `RELAY_*`
//! environment fallback, validated at startup. Invalid configuration is a
//! fatal startup error (§7).

use clap::Parser;

/// Agent relay broker: mediates communication between multiple interactive
/// AI command-line agents, each running under its own pseudoterminal.
#[derive(Debug, Parser)]
#[command(name = "relay-broker", version, about)]
pub struct Config {
    /// HTTP port to listen on.
    #[arg(long, env = "RELAY_PORT", default_value = "4590")]
    pub port: u16,

    /// Host address to bind to.
    #[arg(long, env = "RELAY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Bearer token for API authentication. Required in production; a
    /// missing token is only tolerated when `--insecure` is set.
    #[arg(long, env = "RELAY_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Allow starting without an auth token (for local development/tests).
    #[arg(long, env = "RELAY_INSECURE", default_value = "false")]
    pub insecure: bool,

    /// Replay ring capacity, in events (§4.7 default 1000).
    #[arg(long, env = "RELAY_RING_CAPACITY", default_value = "1000")]
    pub ring_capacity: usize,

    /// Seconds of PTY activity silence before a worker is `online` (§5).
    #[arg(long, env = "RELAY_ONLINE_THRESHOLD_SECS", default_value = "30")]
    pub online_threshold_secs: u64,

    /// Seconds of PTY activity silence before a worker is `stuck` (§5).
    #[arg(long, env = "RELAY_STUCK_THRESHOLD_SECS", default_value = "300")]
    pub stuck_threshold_secs: u64,

    /// Grace window in seconds before an injected, unacknowledged message
    /// becomes `uncertain` (§4.6 default 30s for non-`AWAIT` messages).
    #[arg(long, env = "RELAY_DELIVERY_GRACE_SECS", default_value = "30")]
    pub delivery_grace_secs: u64,

    /// Self-echo suppression window in seconds (§8 scenario S6 default 2s).
    #[arg(long, env = "RELAY_ECHO_WINDOW_SECS", default_value = "2")]
    pub echo_window_secs: u64,

    /// Inbound event_id dedup window in seconds.
    #[arg(long, env = "RELAY_DEDUP_WINDOW_SECS", default_value = "300")]
    pub dedup_window_secs: u64,

    /// PTY grace period in milliseconds between SIGTERM and SIGKILL on close.
    #[arg(long, env = "RELAY_CLOSE_GRACE_MS", default_value = "50")]
    pub close_grace_ms: u64,

    /// Seconds of continued PTY silence after a `busy` transition before an
    /// agent is swept back to `idle` (§4.6 verification strategy b: the
    /// idle→busy→idle crossing that counts as delivery verification).
    #[arg(long, env = "RELAY_BUSY_IDLE_SECS", default_value = "2")]
    pub busy_idle_secs: u64,

    /// Default terminal columns for spawned agents.
    #[arg(long, env = "RELAY_COLS", default_value = "200")]
    pub cols: u16,

    /// Default terminal rows for spawned agents.
    #[arg(long, env = "RELAY_ROWS", default_value = "50")]
    pub rows: u16,

    /// Log format (json or text).
    #[arg(long, env = "RELAY_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// If true, a spawn with a name already live is a fatal startup-class
    /// error rather than a surfaced `NameConflict` (§8 boundary behavior).
    #[arg(long, env = "RELAY_STRICT_NAMES", default_value = "false")]
    pub strict_names: bool,

    /// Path to a cached external-bus workspace token (§4.8 token seeding
    /// precedence: env > cache > fresh creation).
    #[arg(long, env = "RELAY_TOKEN_CACHE_PATH")]
    pub token_cache_path: Option<std::path::PathBuf>,
}

impl Config {
    /// Validate the configuration after parsing. Invalid configuration is a
    /// `Fatal` startup error (§7): the process should exit rather than run
    /// with a nonsensical configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            anyhow::bail!("--port must be nonzero");
        }
        if self.auth_token.is_none() && !self.insecure {
            anyhow::bail!("--auth-token is required unless --insecure is set");
        }
        if self.ring_capacity == 0 {
            anyhow::bail!("--ring-capacity must be nonzero");
        }
        if self.online_threshold_secs == 0 {
            anyhow::bail!("--online-threshold-secs must be nonzero");
        }
        if self.stuck_threshold_secs <= self.online_threshold_secs {
            anyhow::bail!("--stuck-threshold-secs must exceed --online-threshold-secs");
        }
        if self.busy_idle_secs == 0 {
            anyhow::bail!("--busy-idle-secs must be nonzero");
        }
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid --log-format: {other}"),
        }
        Ok(())
    }
}
