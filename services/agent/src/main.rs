//! skiff Agent
//!
//! Per-node daemon of the skiff cluster manager. Receives tasks from the
//! central master, runs them through framework executors, and reports task
//! state back reliably.

use std::sync::Arc;

use anyhow::Result;
use skiff_agent::agent::{Agent, AgentEvent};
use skiff_agent::config::Config;
use skiff_agent::http;
use skiff_agent::isolator::MockIsolator;
use skiff_agent::outbox::HttpOutbox;
use skiff_messages::MasterToAgent;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting skiff agent");

    let config = Config::from_env()?;
    info!(
        work_dir = %config.work_dir.display(),
        recover = ?config.recover,
        checkpoint = config.checkpoint,
        "Configuration loaded"
    );

    // TODO(isolation): wire the container isolator once it lands; the mock
    // accepts launches without starting processes.
    let isolator = Arc::new(MockIsolator::new());
    let outbox = Arc::new(HttpOutbox::new());

    let handle = Agent::spawn(config.clone(), isolator, outbox)?;

    // Read-only endpoints plus the message inbox.
    let http = tokio::spawn(http::serve(config.http_listen_addr, handle.sender()));

    // A local interrupt is treated like a master-initiated shutdown.
    let tx = handle.sender();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, shutting down");
            let _ = tx
                .send(AgentEvent::Master {
                    message: MasterToAgent::Shutdown,
                    from: None,
                })
                .await;
        }
    });

    tokio::select! {
        result = handle.join() => result,
        result = http => result?,
    }
}
