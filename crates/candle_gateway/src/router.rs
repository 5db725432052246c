//! Subscription router: bus → debounce → WebSocket.
//!
//! Binds each (session, key) pair to its own bus subscription. Every payload
//! received on that subscription is decoded and handed to the debouncer;
//! when the window elapses the latest payload is written to the session as a
//! `candle` frame.

use crate::bus::{Bus, BusSubscription};
use crate::client::ClientState;
use crate::debounce::{CoalesceMode, Debouncer, DEFAULT_WINDOW};
use crate::error::{GatewayError, Result};
use crate::protocol::ServerMessage;
use crate::subscription::{SubKey, SubscriptionHandle, TimerKey};
use futures::StreamExt;
use metrics::counter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for the subscription router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Namespace prepended to every bus subject.
    pub subject_prefix: String,
    /// Coalescing window per (session, key).
    pub window: Duration,
    /// Debounce or throttle.
    pub mode: CoalesceMode,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            subject_prefix: "up5".to_string(),
            window: DEFAULT_WINDOW,
            mode: CoalesceMode::Debounce,
        }
    }
}

/// Routes bus messages to the sessions that subscribed to them.
pub struct SubscriptionRouter {
    bus: Arc<dyn Bus>,
    debouncer: Arc<Debouncer<TimerKey>>,
    config: RouterConfig,
}

impl SubscriptionRouter {
    pub fn new(bus: Arc<dyn Bus>, config: RouterConfig) -> Self {
        Self {
            bus,
            debouncer: Arc::new(Debouncer::new(config.mode)),
            config,
        }
    }

    /// Number of pending coalesced deliveries across all sessions.
    pub fn pending_timers(&self) -> usize {
        self.debouncer.pending()
    }

    pub fn is_pending(&self, client: &ClientState, key: &SubKey) -> bool {
        self.debouncer.is_pending(&TimerKey::new(&client.id, key))
    }

    /// Subscribe `client` to `key`, replacing any existing subscription for
    /// the same key. Returns the bus subject.
    pub async fn subscribe(&self, client: &Arc<ClientState>, key: SubKey) -> Result<String> {
        let subject = key.subject(&self.config.subject_prefix);
        let timer_key = TimerKey::new(&client.id, &key);

        if let Some((_, old)) = client.subscriptions.remove(&key) {
            debug!("Client {} resubscribing to {}", client.id, key);
            old.release();
            self.debouncer.cancel(&timer_key);
        }

        let subscription = self.bus.subscribe(&subject).await?;
        let handle = self.spawn_forwarder(client, key.clone(), timer_key, subscription);

        // The session may have been torn down while the bus call was pending.
        if !client.is_open() {
            handle.release();
            return Err(GatewayError::ClientClosed);
        }

        if let Some(previous) = client.subscriptions.insert(key.clone(), handle) {
            previous.release();
        }

        // A teardown that snapshotted the map before the insert missed this
        // handle; it marked the session closed first, so it is visible here.
        if !client.is_open() {
            if let Some((_, handle)) = client.subscriptions.remove(&key) {
                handle.release();
            }
            return Err(GatewayError::ClientClosed);
        }

        counter!("gateway_subscriptions_total").increment(1);
        info!("Client {} subscribed to {} ({})", client.id, key, subject);
        Ok(subject)
    }

    /// Drop `client`'s subscription to `key`. Returns false if there was none.
    pub fn unsubscribe(&self, client: &ClientState, key: &SubKey) -> bool {
        match client.subscriptions.remove(key) {
            Some((_, handle)) => {
                handle.release();
                self.debouncer.cancel(&TimerKey::new(&client.id, key));
                info!("Client {} unsubscribed from {}", client.id, key);
                true
            }
            None => {
                debug!("Client {} not subscribed to {}, ignoring", client.id, key);
                false
            }
        }
    }

    /// Release every subscription and pending timer belonging to `client`.
    ///
    /// Returns the number of subscriptions released.
    pub fn teardown(&self, client: &ClientState) -> usize {
        client.mark_closed();
        let keys = client.subscription_keys();
        let mut released = 0;
        for key in &keys {
            if let Some((_, handle)) = client.subscriptions.remove(key) {
                handle.release();
                released += 1;
            }
            self.debouncer.cancel(&TimerKey::new(&client.id, key));
        }
        client.subscriptions.clear();

        if released > 0 {
            debug!(
                "Released {} subscriptions for client {}",
                released, client.id
            );
        }
        released
    }

    /// Discard timers left behind by in-flight messages and close the bus.
    pub async fn close(&self) -> Result<()> {
        let cancelled = self.debouncer.cancel_all();
        if cancelled > 0 {
            debug!("Cancelled {} pending timers at shutdown", cancelled);
        }
        self.bus.close().await
    }

    fn spawn_forwarder(
        &self,
        client: &Arc<ClientState>,
        key: SubKey,
        timer_key: TimerKey,
        subscription: BusSubscription,
    ) -> SubscriptionHandle {
        let live = Arc::new(AtomicBool::new(true));
        let subject = subscription.subject.clone();
        let mut messages = subscription.messages;

        let task_live = live.clone();
        let client = client.clone();
        let debouncer = self.debouncer.clone();
        let window = self.config.window;

        let task = tokio::spawn(async move {
            while let Some(payload) = messages.next().await {
                if !task_live.load(Ordering::Acquire) {
                    break;
                }
                let data: serde_json::Value = match serde_json::from_slice(&payload) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(
                            "Dropping malformed payload for {} on {}: {}",
                            client.id, key, e
                        );
                        counter!("gateway_decode_errors_total").increment(1);
                        continue;
                    }
                };

                let producer = {
                    let client = client.clone();
                    let live = task_live.clone();
                    let key = key.clone();
                    move || deliver(&client, &live, &key, data)
                };
                if !debouncer.schedule_while(timer_key.clone(), &task_live, producer, window) {
                    break;
                }
            }
            debug!("Bus stream for {} on client {} ended", key, client.id);
        });

        SubscriptionHandle::new(subject, live, task)
    }
}

fn deliver(client: &ClientState, live: &AtomicBool, key: &SubKey, data: serde_json::Value) {
    if !live.load(Ordering::Acquire) || !client.is_open() {
        return;
    }
    match client.send(ServerMessage::candle(key, data)) {
        Ok(()) => counter!("gateway_candles_sent_total").increment(1),
        Err(e) => warn!("Failed to send candle for {} to {}: {}", key, client.id, e),
    }
}
