//! WebSocket protocol message types.
//!
//! Defines the JSON message format for client-server communication. Both
//! directions are closed tagged unions keyed on `type`; an unknown `type`
//! fails to parse and is reported back as an `error` frame.

use crate::error::Result;
use crate::subscription::SubKey;
use serde::{Deserialize, Serialize};

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Message sent from client to server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving candles for a symbol.
    Subscribe(SubscriptionRequest),
    /// Stop receiving candles for a symbol.
    Unsubscribe(SubscriptionRequest),
    /// Application-level keepalive.
    Ping,
}

/// Fields shared by subscribe and unsubscribe requests.
///
/// `symbol` is optional at the wire level so a missing symbol surfaces as a
/// validation error naming the field rather than a generic parse failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionRequest {
    pub symbol: Option<String>,
    pub exchange: Option<String>,
    pub timeframe: Option<String>,
}

impl SubscriptionRequest {
    /// Resolve into a validated key, applying exchange/timeframe defaults.
    pub fn into_key(self) -> Result<SubKey> {
        SubKey::new(self.symbol, self.exchange, self.timeframe)
    }
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Message sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once, right after the connection is accepted.
    Connected {
        #[serde(rename = "clientId")]
        client_id: String,
        message: String,
    },
    /// Confirmation of subscription.
    Subscribed {
        symbol: String,
        exchange: String,
        timeframe: String,
        subject: String,
    },
    /// Confirmation of unsubscription.
    Unsubscribed {
        symbol: String,
        exchange: String,
        timeframe: String,
    },
    /// Coalesced candle update, payload passed through as decoded JSON.
    Candle {
        symbol: String,
        exchange: String,
        timeframe: String,
        data: serde_json::Value,
    },
    /// Pong response to ping.
    Pong,
    /// Error message.
    Error {
        message: String,
        code: String,
    },
}

impl ServerMessage {
    pub fn subscribed(key: &SubKey, subject: String) -> Self {
        ServerMessage::Subscribed {
            symbol: key.symbol.clone(),
            exchange: key.exchange.clone(),
            timeframe: key.timeframe.clone(),
            subject,
        }
    }

    pub fn unsubscribed(key: &SubKey) -> Self {
        ServerMessage::Unsubscribed {
            symbol: key.symbol.clone(),
            exchange: key.exchange.clone(),
            timeframe: key.timeframe.clone(),
        }
    }

    pub fn candle(key: &SubKey, data: serde_json::Value) -> Self {
        ServerMessage::Candle {
            symbol: key.symbol.clone(),
            exchange: key.exchange.clone(),
            timeframe: key.timeframe.clone(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_subscribe() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"subscribe","symbol":"PETR4","exchange":"B","timeframe":"1m"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Subscribe(req) => {
                let key = req.into_key().unwrap();
                assert_eq!(key.to_string(), "PETR4:B:1m");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_subscribe_without_symbol() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","exchange":"B","timeframe":"1m"}"#)
                .unwrap();
        let ClientMessage::Subscribe(req) = msg else {
            panic!("expected subscribe");
        };
        let err = req.into_key().unwrap_err();
        assert_eq!(err.to_string(), "Missing required field: symbol");
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_parse_ping() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = serde_json::from_str::<ClientMessage>(r#"{"type":"snapshot"}"#).unwrap_err();
        assert!(err.to_string().contains("unknown variant"));
        assert!(serde_json::from_str::<ClientMessage>(r#"{"symbol":"PETR4"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[test]
    fn test_serialize_server_messages() {
        let connected = ServerMessage::Connected {
            client_id: "client_1_abc".to_string(),
            message: "Connected".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&connected).unwrap(),
            json!({"type": "connected", "clientId": "client_1_abc", "message": "Connected"})
        );

        let key = SubKey::new(Some("PETR4".to_string()), None, None).unwrap();
        assert_eq!(
            serde_json::to_value(ServerMessage::subscribed(&key, key.subject("up5"))).unwrap(),
            json!({
                "type": "subscribed",
                "symbol": "PETR4",
                "exchange": "B",
                "timeframe": "1m",
                "subject": "up5.candles.B.PETR4.1m"
            })
        );

        let candle = ServerMessage::candle(&key, json!({"close": 37.5}));
        assert_eq!(
            serde_json::to_value(&candle).unwrap(),
            json!({
                "type": "candle",
                "symbol": "PETR4",
                "exchange": "B",
                "timeframe": "1m",
                "data": {"close": 37.5}
            })
        );

        assert_eq!(
            serde_json::to_value(ServerMessage::Pong).unwrap(),
            json!({"type": "pong"})
        );
    }
}
