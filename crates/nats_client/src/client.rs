//! NATS client wrapper for the gateway's single bus connection.

use anyhow::{Context, Result};
use async_nats::{Client, Subscriber};
use tracing::{debug, info};

/// Wrapper around the one NATS connection shared by every session.
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
    url: String,
}

impl NatsClient {
    /// Connect to a NATS server.
    ///
    /// Fails if the initial connection cannot be established; there is no
    /// retry here, callers treat this as a fatal startup error.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);
        let client = async_nats::connect(url)
            .await
            .with_context(|| format!("failed to connect to NATS at {url}"))?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    /// Subscribe to a single subject using NATS Core (push delivery).
    ///
    /// Dropping the returned subscriber unsubscribes it on the server.
    pub async fn subscribe(&self, subject: &str) -> Result<Subscriber> {
        debug!("Subscribing to subject: {}", subject);
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .with_context(|| format!("failed to subscribe to {subject}"))?;
        Ok(subscriber)
    }

    /// Drain and release the connection.
    ///
    /// Remaining subscriptions are unsubscribed, buffered messages are
    /// flushed, and the connection is closed once the drain completes.
    pub async fn close(&self) -> Result<()> {
        info!("Draining NATS connection to {}", self.url);
        self.client
            .drain()
            .await
            .with_context(|| format!("failed to drain NATS connection to {}", self.url))?;
        Ok(())
    }
}
