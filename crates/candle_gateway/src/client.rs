//! Client session state and registry.
//!
//! Each WebSocket connection owns one [`ClientState`]. Its subscription map
//! is only mutated by the router acting on that connection's own frames (or
//! by teardown), so sessions never contend with each other.

use crate::error::Result;
use crate::protocol::ServerMessage;
use crate::subscription::{SubKey, SubscriptionHandle};
use axum::extract::ws::Message;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};
use uuid::Uuid;

/// Unique client identifier, e.g. `client_1718000000000_3f9a2c1b7`.
pub type ClientId = String;

/// Allocate a fresh, collision-resistant client id.
pub fn new_client_id() -> ClientId {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("client_{}_{}", Utc::now().timestamp_millis(), &suffix[..9])
}

/// State for a single connected client.
pub struct ClientState {
    /// Unique client identifier.
    pub id: ClientId,
    /// Channel to the task writing this client's WebSocket.
    tx: mpsc::UnboundedSender<Message>,
    /// Live bus subscriptions, at most one per key.
    pub subscriptions: DashMap<SubKey, SubscriptionHandle>,
    open: AtomicBool,
    close_requested: Notify,
}

impl ClientState {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self::with_id(new_client_id(), tx)
    }

    pub fn with_id(id: ClientId, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            tx,
            subscriptions: DashMap::new(),
            open: AtomicBool::new(true),
            close_requested: Notify::new(),
        }
    }

    /// Whether writes to this client can still succeed.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Send a message to this client.
    ///
    /// Writes to a session that is no longer open are skipped, not errors.
    pub fn send(&self, msg: ServerMessage) -> Result<()> {
        if !self.is_open() {
            debug!("Skipping write to closed client {}", self.id);
            return Ok(());
        }
        let json = serde_json::to_string(&msg)?;
        if self.tx.send(Message::Text(json.into())).is_err() {
            debug!("Client {} writer gone, marking closed", self.id);
            self.mark_closed();
        }
        Ok(())
    }

    /// Queue a raw transport frame (e.g. a pong) if the client is open.
    pub fn send_raw(&self, msg: Message) {
        if self.is_open() && self.tx.send(msg).is_err() {
            self.mark_closed();
        }
    }

    /// Server-initiated close: queue a close frame and wake the connection loop.
    ///
    /// Returns false if the client was already closed.
    pub fn close(&self) -> bool {
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.send(Message::Close(None));
        self.close_requested.notify_one();
        true
    }

    /// Record that the socket is gone; no further writes are attempted.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.close_requested.notified().await
    }

    pub fn subscription_keys(&self) -> Vec<SubKey> {
        self.subscriptions.iter().map(|e| e.key().clone()).collect()
    }
}

/// Registry of connected clients, owned by the gateway server.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<ClientState>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Register a new client.
    pub fn register(&self, client: Arc<ClientState>) -> ClientId {
        let id = client.id.clone();
        self.clients.insert(id.clone(), client);
        info!("Client {} registered", id);
        id
    }

    /// Remove a client, handing it back so its teardown runs exactly once.
    pub fn unregister(&self, client_id: &str) -> Option<Arc<ClientState>> {
        let removed = self.clients.remove(client_id).map(|(_, client)| client);
        if removed.is_some() {
            info!("Client {} unregistered", client_id);
        }
        removed
    }

    /// Get a client by ID.
    pub fn get(&self, client_id: &str) -> Option<Arc<ClientState>> {
        self.clients.get(client_id).map(|r| r.clone())
    }

    /// Snapshot of every registered client.
    pub fn all(&self) -> Vec<Arc<ClientState>> {
        self.clients.iter().map(|e| e.value().clone()).collect()
    }

    /// Get the total number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Get the total number of live subscriptions across all clients.
    pub fn subscription_count(&self) -> usize {
        self.clients
            .iter()
            .map(|e| e.value().subscriptions.len())
            .sum()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
