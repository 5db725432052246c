//! WebSocket server handler using Axum.

use crate::bus::Bus;
use crate::client::{ClientId, ClientRegistry, ClientState};
use crate::error::Result;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::router::{RouterConfig, SubscriptionRouter};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// How long a server-closed connection may take to flush its close frame.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared application state: the session table plus the router.
pub struct AppState {
    pub registry: Arc<ClientRegistry>,
    pub router: Arc<SubscriptionRouter>,
    accepting: AtomicBool,
}

impl AppState {
    pub fn new(bus: Arc<dyn Bus>, config: RouterConfig) -> Self {
        Self {
            registry: Arc::new(ClientRegistry::new()),
            router: Arc::new(SubscriptionRouter::new(bus, config)),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Tear down a session. Only the first call for a given id does any work.
    pub fn disconnect(&self, client_id: &str) -> bool {
        let Some(client) = self.registry.unregister(client_id) else {
            return false;
        };
        let released = self.router.teardown(&client);

        counter!("gateway_disconnections_total").increment(1);
        gauge!("gateway_active_connections").set(self.registry.client_count() as f64);
        info!(
            "Client {} disconnected ({} subscriptions released)",
            client_id, released
        );
        true
    }

    /// Process-wide shutdown.
    ///
    /// Stops accepting, closes and tears down every session, and only then
    /// closes the bus so that no unsubscribe targets a closed connection.
    pub async fn shutdown(&self) -> Result<()> {
        self.accepting.store(false, Ordering::Release);

        let clients = self.registry.all();
        info!("Shutting down, closing {} client sessions", clients.len());
        for client in clients {
            client.close();
            self.disconnect(&client.id);
        }

        self.router.close().await
    }
}

/// Create the WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = if state.is_accepting() {
        "ok"
    } else {
        "shutting_down"
    };
    Json(json!({
        "status": status,
        "clients": state.registry.client_count(),
        "subscriptions": state.registry.subscription_count(),
        "pending_timers": state.router.pending_timers(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    if !state.is_accepting() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let client = Arc::new(ClientState::new(tx));
    let client_id: ClientId = state.registry.register(client.clone());

    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.client_count() as f64);
    info!("Client {} connected", client_id);

    // Forward queued frames to the socket; a close frame is the last write.
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if ws_tx.send(msg).await.is_err() || is_close {
                break;
            }
        }
    });

    if let Err(e) = client.send(ServerMessage::Connected {
        client_id: client_id.clone(),
        message: "Connected to candle gateway".to_string(),
    }) {
        warn!("Failed to send connected frame to {}: {}", client_id, e);
    }

    let closed_by_server = loop {
        tokio::select! {
            biased;

            _ = client.closed() => break true,

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break false,
                    Some(Ok(msg)) => {
                        if let Err(e) = handle_message(&state, &client, msg).await {
                            warn!("Error handling message from {}: {}", client_id, e);
                            let frame = ServerMessage::Error {
                                message: e.to_string(),
                                code: e.code().to_string(),
                            };
                            if let Err(e) = client.send(frame) {
                                warn!("Failed to send error frame to {}: {}", client_id, e);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        // The transport is gone; cleanup below is the close path.
                        warn!("WebSocket error for {}: {}", client_id, e);
                        break false;
                    }
                }
            }
        }
    };

    state.disconnect(&client_id);

    if closed_by_server {
        if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut send_task)
            .await
            .is_err()
        {
            send_task.abort();
        }
    } else {
        send_task.abort();
    }
}

/// Handle a single WebSocket message.
async fn handle_message(
    state: &Arc<AppState>,
    client: &Arc<ClientState>,
    msg: Message,
) -> Result<()> {
    match msg {
        Message::Text(text) => {
            let client_msg: ClientMessage = serde_json::from_str(text.as_str())?;
            handle_client_message(state, client, client_msg).await
        }
        Message::Binary(data) => {
            let client_msg: ClientMessage = serde_json::from_slice(&data)?;
            handle_client_message(state, client, client_msg).await
        }
        Message::Ping(data) => {
            client.send_raw(Message::Pong(data));
            Ok(())
        }
        // Close is handled by the connection loop
        Message::Pong(_) | Message::Close(_) => Ok(()),
    }
}

/// Handle a parsed client message.
async fn handle_client_message(
    state: &Arc<AppState>,
    client: &Arc<ClientState>,
    msg: ClientMessage,
) -> Result<()> {
    match msg {
        ClientMessage::Subscribe(request) => {
            let key = request.into_key()?;
            debug!("Client {} subscribing to {}", client.id, key);

            let subject = state.router.subscribe(client, key.clone()).await?;
            client.send(ServerMessage::subscribed(&key, subject))
        }
        ClientMessage::Unsubscribe(request) => {
            let key = request.into_key()?;
            debug!("Client {} unsubscribing from {}", client.id, key);

            if state.router.unsubscribe(client, &key) {
                client.send(ServerMessage::unsubscribed(&key))?;
            }
            Ok(())
        }
        ClientMessage::Ping => client.send(ServerMessage::Pong),
    }
}
