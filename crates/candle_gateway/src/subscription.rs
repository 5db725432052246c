//! Subscription identity and bus subject naming.
//!
//! A client subscribes to a [`SubKey`] (`symbol:exchange:timeframe`); the
//! gateway maps it onto the bus subject
//! `{prefix}.candles.{exchange}.{symbol}.{timeframe}`. That subject format is
//! shared with the upstream publisher and must stay in sync with it.

use crate::client::ClientId;
use crate::error::{GatewayError, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Exchange used when a request omits one.
pub const DEFAULT_EXCHANGE: &str = "B";

/// Timeframe used when a request omits one.
pub const DEFAULT_TIMEFRAME: &str = "1m";

/// Client-facing identity of one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubKey {
    pub symbol: String,
    pub exchange: String,
    pub timeframe: String,
}

impl SubKey {
    /// Build a key, applying defaults and validating every segment.
    pub fn new(
        symbol: Option<String>,
        exchange: Option<String>,
        timeframe: Option<String>,
    ) -> Result<Self> {
        let symbol = match symbol {
            Some(s) if !s.is_empty() => s,
            _ => return Err(GatewayError::MissingField("symbol")),
        };
        let exchange = exchange.unwrap_or_else(|| DEFAULT_EXCHANGE.to_string());
        let timeframe = timeframe.unwrap_or_else(|| DEFAULT_TIMEFRAME.to_string());

        validate_segment("symbol", &symbol)?;
        validate_segment("exchange", &exchange)?;
        validate_segment("timeframe", &timeframe)?;

        Ok(Self {
            symbol,
            exchange,
            timeframe,
        })
    }

    /// Bus subject for this key under `prefix`.
    pub fn subject(&self, prefix: &str) -> String {
        build_subject(prefix, &self.symbol, &self.exchange, &self.timeframe)
    }
}

impl fmt::Display for SubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.symbol, self.exchange, self.timeframe)
    }
}

/// Build a bus subject from its components.
pub fn build_subject(prefix: &str, symbol: &str, exchange: &str, timeframe: &str) -> String {
    format!("{}.candles.{}.{}.{}", prefix, exchange, symbol, timeframe)
}

/// Reject values that would alter the subject's token structure.
///
/// `.` would add tokens, `*` and `>` are NATS wildcards, and whitespace is
/// illegal in subjects.
pub fn validate_segment(field: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(GatewayError::MissingField(field));
    }
    let bad = value
        .chars()
        .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace());
    if bad {
        return Err(GatewayError::InvalidField {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Debounce key: one pending timer per (session, subscription).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub client: ClientId,
    pub sub: SubKey,
}

impl TimerKey {
    pub fn new(client: &ClientId, sub: &SubKey) -> Self {
        Self {
            client: client.clone(),
            sub: sub.clone(),
        }
    }
}

impl fmt::Display for TimerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client, self.sub)
    }
}

/// One live bus subscription owned by a session entry.
///
/// The forwarding task owns the bus stream; aborting it drops the stream,
/// which releases the subscription on the bus. The `live` flag is checked by
/// the forwarding task and by any pending candle producer, so a message that
/// was already in flight when the handle was released is never written.
pub struct SubscriptionHandle {
    subject: String,
    live: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn new(subject: String, live: Arc<AtomicBool>, task: JoinHandle<()>) -> Self {
        Self {
            subject,
            live,
            task,
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Stop forwarding and release the bus subscription. Idempotent.
    pub fn release(&self) {
        self.live.store(false, Ordering::Release);
        self.task.abort();
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("subject", &self.subject)
            .field("live", &self.is_live())
            .finish()
    }
}
