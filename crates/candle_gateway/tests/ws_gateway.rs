//! End-to-end tests: real axum server, in-memory bus, tungstenite client.

use async_trait::async_trait;
use candle_gateway::{create_router, AppState, Bus, BusSubscription, MemoryBus, RouterConfig};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SUBJECT: &str = "test.candles.B.PETR4.1m";

struct TestGateway {
    addr: SocketAddr,
    bus: Arc<MemoryBus>,
    state: Arc<AppState>,
}

fn test_config() -> RouterConfig {
    RouterConfig {
        subject_prefix: "test".to_string(),
        window: Duration::from_millis(30),
        ..RouterConfig::default()
    }
}

async fn serve(state: Arc<AppState>) -> SocketAddr {
    let app = create_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn start_gateway() -> TestGateway {
    let bus = Arc::new(MemoryBus::new());
    let state = Arc::new(AppState::new(bus.clone(), test_config()));
    let addr = serve(state.clone()).await;
    TestGateway { addr, bus, state }
}

async fn connect(addr: SocketAddr) -> (Client, String) {
    let (mut ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    let hello = recv_json(&mut ws).await;
    assert_eq!(hello["type"], "connected");
    let client_id = hello["clientId"].as_str().unwrap().to_string();
    (ws, client_id)
}

async fn send_json(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn recv_json(ws: &mut Client) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_subscribe_receive_unsubscribe() {
    let gateway = start_gateway().await;
    let (mut ws, client_id) = connect(gateway.addr).await;
    assert!(client_id.starts_with("client_"));
    assert!(gateway.state.registry.get(&client_id).is_some());

    send_json(&mut ws, json!({"type": "subscribe", "symbol": "PETR4"})).await;
    assert_eq!(
        recv_json(&mut ws).await,
        json!({
            "type": "subscribed",
            "symbol": "PETR4",
            "exchange": "B",
            "timeframe": "1m",
            "subject": SUBJECT
        })
    );
    assert_eq!(gateway.bus.subscriber_count(SUBJECT), 1);

    for close in [10, 11, 12] {
        gateway.bus.publish(SUBJECT, json!({"close": close}).to_string());
    }
    let candle = recv_json(&mut ws).await;
    assert_eq!(candle["type"], "candle");
    assert_eq!(candle["symbol"], "PETR4");
    assert_eq!(candle["data"], json!({"close": 12}));

    send_json(
        &mut ws,
        json!({"type": "unsubscribe", "symbol": "PETR4", "exchange": "B", "timeframe": "1m"}),
    )
    .await;
    assert_eq!(
        recv_json(&mut ws).await,
        json!({"type": "unsubscribed", "symbol": "PETR4", "exchange": "B", "timeframe": "1m"})
    );
    eventually("bus unsubscribe", || gateway.bus.subscriber_count(SUBJECT) == 0).await;

    // Nothing subscribed any more: publishing reaches no one.
    gateway.bus.publish(SUBJECT, r#"{"close":13}"#);
    send_json(&mut ws, json!({"type": "ping"})).await;
    assert_eq!(recv_json(&mut ws).await, json!({"type": "pong"}));
}

#[tokio::test]
async fn test_invalid_frames_keep_connection_open() {
    let gateway = start_gateway().await;
    let (mut ws, client_id) = connect(gateway.addr).await;

    send_json(&mut ws, json!({"type": "subscribe", "symbol": "PETR4"})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "subscribed");

    send_json(
        &mut ws,
        json!({"type": "subscribe", "exchange": "B", "timeframe": "1m"}),
    )
    .await;
    let err = recv_json(&mut ws).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "VALIDATION_ERROR");
    assert!(err["message"].as_str().unwrap().contains("symbol"));

    // The existing subscription is untouched.
    let client = gateway.state.registry.get(&client_id).unwrap();
    assert_eq!(client.subscription_keys().len(), 1);
    assert_eq!(client.subscription_keys()[0].symbol, "PETR4");
    assert_eq!(gateway.bus.subscriber_count(SUBJECT), 1);

    ws.send(Message::Text("{not json".to_string().into()))
        .await
        .unwrap();
    assert_eq!(recv_json(&mut ws).await["type"], "error");

    send_json(&mut ws, json!({"type": "snapshot"})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "error");

    // Unsubscribing something never subscribed is silent.
    send_json(&mut ws, json!({"type": "unsubscribe", "symbol": "VALE3"})).await;
    send_json(&mut ws, json!({"type": "ping"})).await;
    assert_eq!(recv_json(&mut ws).await, json!({"type": "pong"}));

    assert!(gateway.state.registry.get(&client_id).is_some());
}

#[tokio::test]
async fn test_resubscribe_replaces_handle() {
    let gateway = start_gateway().await;
    let (mut ws, client_id) = connect(gateway.addr).await;

    for _ in 0..2 {
        send_json(&mut ws, json!({"type": "subscribe", "symbol": "PETR4"})).await;
        assert_eq!(recv_json(&mut ws).await["type"], "subscribed");
    }

    let client = gateway.state.registry.get(&client_id).unwrap();
    assert_eq!(client.subscriptions.len(), 1);
    eventually("old subscription released", || {
        gateway.bus.subscriber_count(SUBJECT) == 1
    })
    .await;
}

#[tokio::test]
async fn test_client_close_tears_down_session() {
    let gateway = start_gateway().await;
    let (mut ws, client_id) = connect(gateway.addr).await;

    for symbol in ["PETR4", "VALE3"] {
        send_json(&mut ws, json!({"type": "subscribe", "symbol": symbol})).await;
        assert_eq!(recv_json(&mut ws).await["type"], "subscribed");
    }
    gateway.bus.publish(SUBJECT, r#"{"close":1}"#);

    ws.close(None).await.unwrap();

    eventually("session removed", || {
        gateway.state.registry.get(&client_id).is_none()
    })
    .await;
    eventually("bus subscriptions released", || {
        gateway.bus.total_subscribers() == 0
    })
    .await;
    assert_eq!(gateway.state.router.pending_timers(), 0);
}

#[tokio::test]
async fn test_shutdown_closes_sessions_then_bus() {
    let gateway = start_gateway().await;
    let (mut ws, _) = connect(gateway.addr).await;

    send_json(&mut ws, json!({"type": "subscribe", "symbol": "PETR4"})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "subscribed");

    gateway.state.shutdown().await.unwrap();

    assert_eq!(gateway.state.registry.client_count(), 0);
    assert_eq!(gateway.state.router.pending_timers(), 0);
    assert!(gateway.bus.is_closed());

    // The client sees a close frame (or the stream ending).
    let next = timeout(Duration::from_secs(2), ws.next()).await.unwrap();
    assert!(matches!(next, Some(Ok(Message::Close(_))) | None | Some(Err(_))));

    // New upgrades are refused while shutting down.
    assert!(connect_async(format!("ws://{}/ws", gateway.addr)).await.is_err());
}

/// Bus that records the gateway's state at the moment it is closed.
#[derive(Default)]
struct RecordingBus {
    inner: MemoryBus,
    state: OnceLock<Weak<AppState>>,
    at_close: Mutex<Option<(usize, usize, usize)>>,
}

#[async_trait]
impl Bus for RecordingBus {
    async fn subscribe(&self, subject: &str) -> candle_gateway::Result<BusSubscription> {
        self.inner.subscribe(subject).await
    }

    async fn close(&self) -> candle_gateway::Result<()> {
        if let Some(state) = self.state.get().and_then(Weak::upgrade) {
            *self.at_close.lock().unwrap() = Some((
                state.registry.client_count(),
                state.registry.subscription_count(),
                state.router.pending_timers(),
            ));
        }
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_shutdown_releases_sessions_before_bus() {
    let bus = Arc::new(RecordingBus::default());
    let state = Arc::new(AppState::new(bus.clone(), test_config()));
    bus.state.set(Arc::downgrade(&state)).unwrap();
    let addr = serve(state.clone()).await;

    let (mut alice, _) = connect(addr).await;
    let (mut bob, _) = connect(addr).await;
    for (ws, symbol) in [(&mut alice, "PETR4"), (&mut bob, "VALE3")] {
        send_json(ws, json!({"type": "subscribe", "symbol": symbol})).await;
        assert_eq!(recv_json(ws).await["type"], "subscribed");
    }
    assert_eq!(state.registry.subscription_count(), 2);

    state.shutdown().await.unwrap();

    let (clients, subscriptions, pending_timers) = bus
        .at_close
        .lock()
        .unwrap()
        .take()
        .expect("bus was not closed");
    assert_eq!(clients, 0, "sessions still registered when the bus closed");
    assert_eq!(subscriptions, 0, "subscriptions still held when the bus closed");
    assert_eq!(pending_timers, 0);
    assert!(bus.inner.is_closed());
}
