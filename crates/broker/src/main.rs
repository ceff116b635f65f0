// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `relay-broker`: mediates communication between multiple interactive AI
//! command-line agents, each running under its own pseudoterminal.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use relay_broker::broker::{native_backend_factory, Broker, BrokerSettings};
use relay_broker::config::Config;
use relay_broker::transport::{self, AppState};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    if let Err(e) = config.validate() {
        eprintln!("fatal: invalid configuration: {e}");
        std::process::exit(1);
    }
    init_tracing(&config);

    let settings = BrokerSettings {
        ring_capacity: config.ring_capacity,
        online_threshold_secs: config.online_threshold_secs,
        stuck_threshold_secs: config.stuck_threshold_secs,
        delivery_grace_secs: config.delivery_grace_secs,
        echo_window_secs: config.echo_window_secs,
        dedup_window_secs: config.dedup_window_secs,
        cols: config.cols,
        rows: config.rows,
        strict_names: config.strict_names,
        close_grace_ms: config.close_grace_ms,
        busy_idle_secs: config.busy_idle_secs,
    };

    let broker = Broker::new(settings, native_backend_factory(), None);
    let state = AppState::new(Arc::clone(&broker), config.auth_token.clone());

    let dispatch_broker = Arc::clone(&broker);
    let dispatch_task = tokio::spawn(async move { dispatch_broker.run_dispatch_loop().await });

    let presence_broker = Arc::clone(&broker);
    let presence_shutdown = broker.shutdown_token();
    let presence_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = presence_shutdown.cancelled() => return,
                _ = interval.tick() => {
                    presence_broker.sweep_presence().await;
                    presence_broker.sweep_activity().await;
                }
            }
        }
    });

    let app = transport::router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "relay-broker listening");

    let shutdown_token = broker.shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
        .await?;

    broker.request_shutdown();
    if let Err(e) = dispatch_task.await {
        error!(error = %e, "dispatch loop task panicked");
    }
    presence_task.abort();
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
