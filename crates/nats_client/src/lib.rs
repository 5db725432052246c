//! Process-wide NATS connection used by the candle gateway.

mod client;

pub use async_nats::Subscriber;
pub use client::NatsClient;
