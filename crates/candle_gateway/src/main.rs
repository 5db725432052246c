//! Gateway service entry point.
//!
//! WebSocket gateway relaying debounced candle updates from NATS to clients.

use anyhow::{Context, Result};
use candle_gateway::{create_router, AppState, GatewayConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use nats_client::NatsClient;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(()) => {
            info!("Gateway stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Gateway failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    info!("Starting candle gateway");

    let config = GatewayConfig::from_env()?;

    info!("Configuration:");
    info!("  WS_PORT: {}", config.ws_port);
    info!("  BUS_URL: {}", config.bus_url);
    info!("  SUBJECT_PREFIX: {}", config.subject_prefix);
    info!("  DEBOUNCE_MS: {}", config.window.as_millis());
    info!("  COALESCE_MODE: {}", config.mode);

    if let Some(metrics_port) = config.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], metrics_port))
            .install()
            .context("failed to start Prometheus exporter")?;
        info!("Prometheus metrics server started on port {}", metrics_port);
    }

    // A relay without its bus has nothing to do: fail startup.
    let nats_client = NatsClient::connect(&config.bus_url).await?;
    info!("Connected to NATS");

    let state = Arc::new(AppState::new(
        Arc::new(nats_client),
        config.router_config(),
    ));
    let app = create_router(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.ws_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Gateway listening on {}", addr);

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Sessions first, then the bus; the listener stops once this returns.
            if let Err(e) = shutdown_state.shutdown().await {
                warn!("Error during shutdown: {}", e);
            }
        })
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
