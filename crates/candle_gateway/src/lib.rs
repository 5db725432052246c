//! Gateway service for real-time candle streaming to WebSocket clients.
//!
//! This service:
//! - Accepts WebSocket connections from charting clients
//! - Lets each client subscribe to `symbol:exchange:timeframe` keys
//! - Opens one NATS subscription per (client, key)
//! - Coalesces bursts per (client, key) and forwards only the latest candle
//!
//! ## Architecture
//!
//! ```text
//! NATS: {prefix}.candles.{exchange}.{symbol}.{timeframe}
//!         ↓   (one subscription per client and key)
//! SubscriptionRouter (decode, tag with client + key)
//!         ↓
//! Debouncer (keyed by client + key, latest payload wins)
//!         ↓
//! WebSocket client
//! ```
//!
//! Delivery is at-most-once and best-effort; nothing is persisted.

pub mod bus;
pub mod client;
pub mod config;
pub mod debounce;
pub mod error;
pub mod protocol;
pub mod router;
pub mod subscription;
pub mod ws_server;

pub use bus::{Bus, BusSubscription, MemoryBus};
pub use client::{ClientId, ClientRegistry, ClientState};
pub use config::GatewayConfig;
pub use debounce::{CoalesceMode, Debouncer};
pub use error::{GatewayError, Result};
pub use protocol::{ClientMessage, ServerMessage, SubscriptionRequest};
pub use router::{RouterConfig, SubscriptionRouter};
pub use subscription::{SubKey, SubscriptionHandle, TimerKey};
pub use ws_server::{create_router, AppState};
