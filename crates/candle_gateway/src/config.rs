//! Gateway configuration from environment variables.

use crate::debounce::{CoalesceMode, DEFAULT_WINDOW};
use crate::error::{GatewayError, Result};
use crate::router::RouterConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_WS_PORT: u16 = 8081;
pub const DEFAULT_BUS_URL: &str = "nats://localhost:4222";
pub const DEFAULT_SUBJECT_PREFIX: &str = "up5";

/// Runtime configuration for the gateway process.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    /// WebSocket listen port (`WS_PORT`).
    pub ws_port: u16,
    /// Bus connection string (`BUS_URL`).
    pub bus_url: String,
    /// Subject namespace (`SUBJECT_PREFIX`).
    pub subject_prefix: String,
    /// Coalescing window (`DEBOUNCE_MS`).
    pub window: Duration,
    /// Coalescing strategy (`COALESCE_MODE`).
    pub mode: CoalesceMode,
    /// Prometheus exporter port (`METRICS_PORT`); exporter disabled when unset.
    pub metrics_port: Option<u16>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ws_port: DEFAULT_WS_PORT,
            bus_url: DEFAULT_BUS_URL.to_string(),
            subject_prefix: DEFAULT_SUBJECT_PREFIX.to_string(),
            window: DEFAULT_WINDOW,
            mode: CoalesceMode::default(),
            metrics_port: None,
        }
    }
}

impl GatewayConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let subject_prefix = var("SUBJECT_PREFIX").unwrap_or(defaults.subject_prefix);
        if subject_prefix.contains(|c: char| c == '*' || c == '>' || c.is_whitespace())
            || subject_prefix.ends_with('.')
        {
            return Err(GatewayError::Config(format!(
                "SUBJECT_PREFIX is not a valid subject prefix: {subject_prefix:?}"
            )));
        }

        let window_ms: u64 = parse_var(&var, "DEBOUNCE_MS")?
            .unwrap_or(defaults.window.as_millis() as u64);
        if window_ms == 0 {
            return Err(GatewayError::Config(
                "DEBOUNCE_MS must be greater than zero".to_string(),
            ));
        }

        let mode = match var("COALESCE_MODE") {
            Some(raw) => raw.parse::<CoalesceMode>().map_err(GatewayError::Config)?,
            None => defaults.mode,
        };

        Ok(Self {
            ws_port: parse_var(&var, "WS_PORT")?.unwrap_or(defaults.ws_port),
            bus_url: var("BUS_URL").unwrap_or(defaults.bus_url),
            subject_prefix,
            window: Duration::from_millis(window_ms),
            mode,
            metrics_port: parse_var(&var, "METRICS_PORT")?,
        })
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            subject_prefix: self.subject_prefix.clone(),
            window: self.window,
            mode: self.mode,
        }
    }
}

fn parse_var<T, F>(var: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| GatewayError::Config(format!("{name}={raw:?}: {e}"))),
        None => Ok(None),
    }
}
