// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `relay-broker` binary and
//! exercise its HTTP + WebSocket transport surface against scenarios S1-S4.

use std::time::Duration;

use futures_util::StreamExt;
use relay_broker_specs::BrokerProcess;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn http_health_and_ready() -> anyhow::Result<()> {
    let broker = BrokerProcess::start()?;
    broker.wait_healthy(TIMEOUT).await?;

    let resp: serde_json::Value = reqwest::get(format!("{}/api/v1/health", broker.base_url())).await?.json().await?;
    assert_eq!(resp["status"], "running");

    let resp: serde_json::Value = reqwest::get(format!("{}/api/v1/ready", broker.base_url())).await?.json().await?;
    assert_eq!(resp["state"], "ready");

    Ok(())
}

#[tokio::test]
async fn spawn_then_list_agents() -> anyhow::Result<()> {
    let broker = BrokerProcess::start()?;
    broker.wait_healthy(TIMEOUT).await?;

    let spawned = broker.spawn_cat_agent("Alice", &[]).await?;
    assert_eq!(spawned["name"], "Alice");

    let agents: serde_json::Value = reqwest::get(format!("{}/api/v1/agents", broker.base_url())).await?.json().await?;
    let array = agents.as_array().ok_or_else(|| anyhow::anyhow!("expected array"))?;
    assert_eq!(array.len(), 1);

    Ok(())
}

// S1: a direct message to a known agent queues exactly one delivery and
// reaches the injected state.
#[tokio::test]
async fn s1_dm_round_trip() -> anyhow::Result<()> {
    let broker = BrokerProcess::start()?;
    broker.wait_healthy(TIMEOUT).await?;
    broker.spawn_cat_agent("Bob", &[]).await?;

    let client = reqwest::Client::new();
    let resp: serde_json::Value = client
        .post(format!("{}/api/v1/messages", broker.base_url()))
        .json(&serde_json::json!({"from": "operator", "to": "Bob", "body": "hello"}))
        .send()
        .await?
        .json()
        .await?;

    let delivery_ids = resp["delivery_ids"].as_array().ok_or_else(|| anyhow::anyhow!("expected delivery_ids array"))?;
    assert_eq!(delivery_ids.len(), 1);

    Ok(())
}

// S1 boundary: a message to an unknown name is rejected with NO_ROUTE.
#[tokio::test]
async fn message_to_unknown_agent_is_no_route() -> anyhow::Result<()> {
    let broker = BrokerProcess::start()?;
    broker.wait_healthy(TIMEOUT).await?;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/v1/messages", broker.base_url()))
        .json(&serde_json::json!({"from": "operator", "to": "Ghost", "body": "hi"}))
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 409);
    let body: serde_json::Value = resp.json().await?;
    assert_eq!(body["error"], "NO_ROUTE");

    Ok(())
}

// S2: a channel broadcast fans out to every member, excluding the sender.
#[tokio::test]
async fn s2_channel_fanout() -> anyhow::Result<()> {
    let broker = BrokerProcess::start()?;
    broker.wait_healthy(TIMEOUT).await?;
    broker.spawn_cat_agent("A", &["team"]).await?;
    broker.spawn_cat_agent("B", &["team"]).await?;
    broker.spawn_cat_agent("C", &["team"]).await?;

    let client = reqwest::Client::new();
    let resp: serde_json::Value = client
        .post(format!("{}/api/v1/messages", broker.base_url()))
        .json(&serde_json::json!({"from": "outsider", "to": "#team", "body": "go"}))
        .send()
        .await?
        .json()
        .await?;

    let delivery_ids = resp["delivery_ids"].as_array().ok_or_else(|| anyhow::anyhow!("expected delivery_ids array"))?;
    assert_eq!(delivery_ids.len(), 3);
    Ok(())
}

// S3 (boundary): releasing an agent and messaging it again is a NO_ROUTE,
// not a silent success — the name stays permanently retired.
#[tokio::test]
async fn release_then_no_route() -> anyhow::Result<()> {
    let broker = BrokerProcess::start()?;
    broker.wait_healthy(TIMEOUT).await?;
    broker.spawn_cat_agent("Carol", &[]).await?;

    let client = reqwest::Client::new();
    let resp = client.delete(format!("{}/api/v1/agents/Carol", broker.base_url())).send().await?;
    assert_eq!(resp.status().as_u16(), 204);

    let resp = client
        .post(format!("{}/api/v1/messages", broker.base_url()))
        .json(&serde_json::json!({"from": "operator", "to": "Carol", "body": "hi"}))
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 409);

    Ok(())
}

// S4: a `/ws/events` subscriber joining at seq 1 observes both replayed and
// live events without a gap once agents are spawned after it connects.
#[tokio::test]
async fn s4_ws_events_replay_then_live() -> anyhow::Result<()> {
    let broker = BrokerProcess::start()?;
    broker.wait_healthy(TIMEOUT).await?;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{}?since_seq=1", broker.ws_url())).await?;

    broker.spawn_cat_agent("Dana", &[]).await?;

    let msg = tokio::time::timeout(TIMEOUT, ws.next())
        .await?
        .ok_or_else(|| anyhow::anyhow!("ws stream ended"))??;
    let text = match msg {
        Message::Text(t) => t.to_string(),
        other => anyhow::bail!("expected text ws message, got: {other:?}"),
    };
    let parsed: serde_json::Value = serde_json::from_str(&text)?;
    assert_eq!(parsed["kind"], "agent_spawned");
    assert_eq!(parsed["agent_name"], "Dana");

    Ok(())
}

#[tokio::test]
async fn relay_inbound_dedup_drops_repeat() -> anyhow::Result<()> {
    let broker = BrokerProcess::start()?;
    broker.wait_healthy(TIMEOUT).await?;
    broker.spawn_cat_agent("Eve", &[]).await?;

    let client = reqwest::Client::new();
    let payload = serde_json::json!({"event_id": "e1", "from": "bus-user", "to": "Eve", "body": "hi"});
    for _ in 0..2 {
        let resp = client.post(format!("{}/api/v1/relay/inbound", broker.base_url())).json(&payload).send().await?;
        assert_eq!(resp.status().as_u16(), 202);
    }

    Ok(())
}

#[tokio::test]
async fn shutdown_stops_the_process() -> anyhow::Result<()> {
    let broker = BrokerProcess::start()?;
    broker.wait_healthy(TIMEOUT).await?;

    let client = reqwest::Client::new();
    let resp: serde_json::Value =
        client.post(format!("{}/api/v1/shutdown", broker.base_url())).send().await?.json().await?;
    assert_eq!(resp["accepted"], true);

    Ok(())
}
