// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `relay-broker` binary as a subprocess and exercises it
//! over HTTP and WebSocket.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Once;
use std::time::Duration;

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls.
/// Safe to call multiple times — only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Resolve the path to the compiled `relay-broker` binary.
pub fn broker_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("relay-broker")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// A running `relay-broker` process that is killed on drop.
pub struct BrokerProcess {
    child: Child,
    port: u16,
}

impl BrokerProcess {
    /// Spawn the broker in insecure mode (no auth token) on a free port.
    pub fn start() -> anyhow::Result<Self> {
        ensure_crypto();
        let binary = broker_binary();
        anyhow::ensure!(binary.exists(), "relay-broker binary not found at {}", binary.display());

        let port = free_port()?;
        let child = Command::new(&binary)
            .args([
                "--port",
                &port.to_string(),
                "--host",
                "127.0.0.1",
                "--insecure",
                "--log-format",
                "text",
                "--log-level",
                "warn",
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(Self { child, port })
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws/events", self.port)
    }

    /// Poll `/api/v1/health` until it responds.
    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let client = reqwest::Client::new();
        let url = format!("{}/api/v1/health", self.base_url());
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("relay-broker did not become healthy within {timeout:?}");
            }
            if let Ok(resp) = client.get(&url).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Spawn an agent running `cat` under the broker (a predictable, inert
    /// PTY occupant for routing tests — it never emits a relay block on its
    /// own, so only broker-injected envelopes show up in its input stream).
    pub async fn spawn_cat_agent(&self, name: &str, channels: &[&str]) -> anyhow::Result<serde_json::Value> {
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/api/v1/agents", self.base_url()))
            .json(&serde_json::json!({"name": name, "cli": "cat", "channels": channels}))
            .send()
            .await?;
        Ok(resp.json().await?)
    }
}

impl Drop for BrokerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
