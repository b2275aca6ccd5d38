//! Read-only HTTP endpoints plus the message inbox.
//!
//! `/vars`, `/stats.json` and `/state.json` are side-effect-free reads:
//! each sends a query event into the agent's mailbox and waits for the
//! snapshot, so the entity graph is only ever touched by the actor.
//! `/inbox/master` and `/inbox/executor` feed inbound messages to the same
//! mailbox.

use std::fmt::Write as _;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use skiff_messages::{Endpoint, ExecutorToAgent, MasterToAgent};
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::agent::{AgentEvent, StateSnapshot, StatsSnapshot};

#[derive(Clone)]
struct HttpState {
    tx: mpsc::Sender<AgentEvent>,
}

pub fn router(tx: mpsc::Sender<AgentEvent>) -> Router {
    Router::new()
        .route("/vars", get(vars))
        .route("/stats.json", get(stats_json))
        .route("/state.json", get(state_json))
        .route("/inbox/master", post(inbox_master))
        .route("/inbox/executor", post(inbox_executor))
        .with_state(HttpState { tx })
}

/// Binds and serves until the process exits.
pub async fn serve(addr: SocketAddr, tx: mpsc::Sender<AgentEvent>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;
    info!(addr = %listener.local_addr()?, "HTTP endpoints listening");
    axum::serve(listener, router(tx)).await?;
    Ok(())
}

async fn fetch_stats(state: &HttpState) -> Result<StatsSnapshot, StatusCode> {
    let (reply, rx) = oneshot::channel();
    state
        .tx
        .send(AgentEvent::GetStats { reply })
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    rx.await.map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

async fn vars(State(state): State<HttpState>) -> Result<String, StatusCode> {
    let stats = fetch_stats(&state).await?;

    let mut out = String::new();
    let _ = writeln!(out, "uptime_secs {}", stats.uptime_secs);
    let _ = writeln!(out, "connected {}", u8::from(stats.connected));
    for (name, count) in &stats.tasks {
        let _ = writeln!(out, "tasks_{name} {count}");
    }
    let _ = writeln!(out, "valid_status_updates {}", stats.valid_status_updates);
    let _ = writeln!(out, "invalid_status_updates {}", stats.invalid_status_updates);
    let _ = writeln!(
        out,
        "valid_framework_messages {}",
        stats.valid_framework_messages
    );
    let _ = writeln!(
        out,
        "invalid_framework_messages {}",
        stats.invalid_framework_messages
    );
    Ok(out)
}

async fn stats_json(State(state): State<HttpState>) -> Result<Json<StatsSnapshot>, StatusCode> {
    fetch_stats(&state).await.map(Json)
}

async fn state_json(State(state): State<HttpState>) -> Result<Json<StateSnapshot>, StatusCode> {
    let (reply, rx) = oneshot::channel();
    state
        .tx
        .send(AgentEvent::GetState { reply })
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    rx.await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

#[derive(Debug, Deserialize)]
struct MasterInbound {
    #[serde(default)]
    from: Option<Endpoint>,
    message: MasterToAgent,
}

async fn inbox_master(
    State(state): State<HttpState>,
    Json(inbound): Json<MasterInbound>,
) -> StatusCode {
    let event = AgentEvent::Master {
        message: inbound.message,
        from: inbound.from,
    };
    if state.tx.send(event).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::ACCEPTED
}

#[derive(Debug, Deserialize)]
struct ExecutorInbound {
    from: Endpoint,
    message: ExecutorToAgent,
}

async fn inbox_executor(
    State(state): State<HttpState>,
    Json(inbound): Json<ExecutorInbound>,
) -> StatusCode {
    let event = AgentEvent::Executor {
        message: inbound.message,
        from: inbound.from,
    };
    if state.tx.send(event).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::ACCEPTED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_inbound_deserializes_without_sender() {
        let json = r#"{"message": {"type": "ping"}}"#;
        let inbound: MasterInbound = serde_json::from_str(json).unwrap();
        assert!(inbound.from.is_none());
        assert!(matches!(inbound.message, MasterToAgent::Ping));
    }

    #[test]
    fn test_executor_inbound_requires_sender() {
        let json = r#"{"message": {"type": "register_executor",
                        "framework_id": "f1", "executor_id": "e1"}}"#;
        assert!(serde_json::from_str::<ExecutorInbound>(json).is_err());

        let json = r#"{"from": "http://exec:1",
                       "message": {"type": "register_executor",
                        "framework_id": "f1", "executor_id": "e1"}}"#;
        let inbound: ExecutorInbound = serde_json::from_str(json).unwrap();
        assert_eq!(inbound.from.as_str(), "http://exec:1");
    }
}
