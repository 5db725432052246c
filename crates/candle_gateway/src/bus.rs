//! Message bus abstraction.
//!
//! The gateway only needs two things from the bus: per-subject subscriptions
//! delivering raw payloads, and a way to release the connection at shutdown.
//! [`NatsClient`] is the production backend; [`MemoryBus`] delivers in-process
//! and backs the tests.

use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use nats_client::NatsClient;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// A live bus subscription.
///
/// Dropping `messages` releases the subscription on the bus.
pub struct BusSubscription {
    pub subject: String,
    pub messages: BoxStream<'static, Bytes>,
}

impl fmt::Debug for BusSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusSubscription")
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

/// Publish/subscribe backend the gateway relays from.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Subscribe to exactly one subject.
    async fn subscribe(&self, subject: &str) -> Result<BusSubscription>;

    /// Release the connection. Only called once, during shutdown.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl Bus for NatsClient {
    async fn subscribe(&self, subject: &str) -> Result<BusSubscription> {
        let subscriber = NatsClient::subscribe(self, subject).await?;
        Ok(BusSubscription {
            subject: subject.to_string(),
            messages: subscriber.map(|msg| msg.payload).boxed(),
        })
    }

    async fn close(&self) -> Result<()> {
        NatsClient::close(self).await?;
        Ok(())
    }
}

/// In-process bus. Single node only, no persistence.
///
/// Every subscription gets its own channel, so publishing to a subject
/// reaches each live subscriber once, in publish order.
#[derive(Default)]
pub struct MemoryBus {
    subjects: DashMap<String, Vec<mpsc::UnboundedSender<Bytes>>>,
    closed: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `payload` to every live subscriber of `subject`.
    ///
    /// Returns the number of subscribers reached.
    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        match self.subjects.get_mut(subject) {
            Some(mut senders) => {
                senders.retain(|tx| tx.unbounded_send(payload.clone()).is_ok());
                senders.len()
            }
            None => 0,
        }
    }

    /// Number of live subscriptions to `subject`.
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.subjects
            .get(subject)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Number of live subscriptions across all subjects.
    pub fn total_subscribers(&self) -> usize {
        self.subjects
            .iter()
            .map(|entry| entry.value().iter().filter(|tx| !tx.is_closed()).count())
            .sum()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn subscribe(&self, subject: &str) -> Result<BusSubscription> {
        if self.is_closed() {
            return Err(GatewayError::BusClosed);
        }
        let (tx, rx) = mpsc::unbounded();
        let mut senders = self.subjects.entry(subject.to_string()).or_default();
        senders.retain(|tx| !tx.is_closed());
        senders.push(tx);
        debug!("Memory bus subscription to {}", subject);

        Ok(BusSubscription {
            subject: subject.to_string(),
            messages: rx.boxed(),
        })
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        // Dropping the senders ends every open stream.
        self.subjects.clear();
        info!("Memory bus closed");
        Ok(())
    }
}
