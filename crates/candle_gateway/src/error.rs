//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
///
/// The `Display` text of client-facing variants is sent verbatim in `error`
/// frames, so keep it short and free of internals.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Bus connection or subscription error.
    #[error("Bus error: {0}")]
    Bus(#[from] anyhow::Error),

    /// The bus connection was already closed.
    #[error("Bus connection closed")]
    BusClosed,

    /// JSON serialization/deserialization error.
    #[error("Invalid message: {0}")]
    Json(#[from] serde_json::Error),

    /// A required request field was absent or empty.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// A request field cannot be used as a subject token.
    #[error("Invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },

    /// Configuration value could not be parsed.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The session closed while a request was in flight.
    #[error("Client connection closed")]
    ClientClosed,
}

impl GatewayError {
    /// Short machine-readable code carried alongside the message in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Json(_) => "INVALID_MESSAGE",
            GatewayError::MissingField(_) | GatewayError::InvalidField { .. } => {
                "VALIDATION_ERROR"
            }
            GatewayError::Bus(_) | GatewayError::BusClosed => "BUS_ERROR",
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::ClientClosed => "CLIENT_CLOSED",
        }
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
