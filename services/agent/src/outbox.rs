//! Message delivery seam.
//!
//! Everything the agent emits goes through an [`Outbox`]: tests plug in a
//! channel and inspect traffic; the daemon uses JSON-over-HTTP delivery.
//! Delivery is best-effort by design; reliability lives in the layers that
//! retry (registration, the status-update pipeline).

use std::time::Duration;

use async_trait::async_trait;
use skiff_messages::{AgentOutbound, Endpoint};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[async_trait]
pub trait Outbox: Send + Sync {
    /// Deliver one message to an endpoint.
    async fn send(&self, to: &Endpoint, message: AgentOutbound);
}

// =============================================================================
// Channel outbox (tests)
// =============================================================================

/// Outbox that hands every message to an in-process channel.
pub struct ChannelOutbox {
    tx: mpsc::UnboundedSender<(Endpoint, AgentOutbound)>,
}

impl ChannelOutbox {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(Endpoint, AgentOutbound)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Outbox for ChannelOutbox {
    async fn send(&self, to: &Endpoint, message: AgentOutbound) {
        // Receiver gone means the test is done observing; drop quietly.
        let _ = self.tx.send((to.clone(), message));
    }
}

// =============================================================================
// HTTP outbox (deployment)
// =============================================================================

/// Outbox that POSTs tagged JSON to `{endpoint}/inbox/agent`.
pub struct HttpOutbox {
    client: reqwest::Client,
}

impl HttpOutbox {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");
        Self { client }
    }
}

impl Default for HttpOutbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Outbox for HttpOutbox {
    async fn send(&self, to: &Endpoint, message: AgentOutbound) {
        let url = format!("{}/inbox/agent", to.as_str().trim_end_matches('/'));
        debug!(url = %url, "Delivering message");

        match self.client.post(&url).json(&message).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(url = %url, status = %response.status(), "Message rejected");
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Message delivery failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_outbox_delivers_in_order() {
        let (outbox, mut rx) = ChannelOutbox::new();
        let to = Endpoint::new("http://master:5050");

        outbox.send(&to, AgentOutbound::Pong).await;
        outbox.send(&to, AgentOutbound::ShutdownExecutor).await;

        let (ep, first) = rx.recv().await.unwrap();
        assert_eq!(ep, to);
        assert!(matches!(first, AgentOutbound::Pong));
        let (_, second) = rx.recv().await.unwrap();
        assert!(matches!(second, AgentOutbound::ShutdownExecutor));
    }

    #[tokio::test]
    async fn test_channel_outbox_survives_dropped_receiver() {
        let (outbox, rx) = ChannelOutbox::new();
        drop(rx);
        outbox
            .send(&Endpoint::new("http://master:5050"), AgentOutbound::Pong)
            .await;
    }
}
