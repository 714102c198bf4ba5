//! # GM3 Gateway Service - Main Entry Point
//!
//! Bridges an HTTP control plane to a GM3 heat-pump controller bus over
//! RS-485. On startup the service opens the serial port, registers on the
//! bus (auto-claiming an address on first run), discovers the controller's
//! parameter catalog and starts the polling loop; the REST API serves
//! cached values and mediates writes.
//!
//! ## Usage
//!
//! ```bash
//! # Start with environment configuration
//! SERIAL_PORT=/dev/ttyUSB0 gm3srv
//!
//! # Start with a config file and debug logging
//! RUST_LOG=debug gm3srv --config config/gm3srv.yaml
//! ```

use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info};
use tracing_subscriber::fmt::writer::MakeWriterExt;

use gm3srv::api;
use gm3srv::core::config::GatewayConfig;
use gm3srv::core::engine::GatewayController;
use gm3srv::utils::error::{GatewayError, Result};

/// Command line arguments for the GM3 gateway service
#[derive(Parser)]
#[command(
    name = "gm3srv",
    version = env!("CARGO_PKG_VERSION"),
    about = "HTTP gateway for GM3 heat-pump controllers",
    long_about = "Local gateway bridging a REST API to the token-arbitrated GM3 RS-485 bus"
)]
struct Args {
    /// Optional YAML configuration file (environment variables win)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Log directory path
    #[arg(long, default_value = "logs")]
    log_dir: String,

    /// Override log level (debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Missing .env is the normal case on a deployed gateway.
    let _ = dotenv();

    let config = match GatewayConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return Err(e);
        }
    };

    let log_level = args.log_level.unwrap_or_else(|| config.log_level.clone());
    let _log_guard = init_tracing(&args.log_dir, &log_level)?;

    info!("Starting GM3 gateway v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Serial: {} @ {} baud, controller address {}, token {}",
        config.serial_port,
        config.serial_baud,
        config.destination_address,
        if config.token_required {
            "required"
        } else {
            "optional (idle fallback)"
        }
    );

    let bind_address = config.api_bind_address();
    let controller = Arc::new(GatewayController::start(config));

    let app = api::api_routes(controller.clone()).layer(
        tower_http::cors::CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_headers([axum::http::header::CONTENT_TYPE])
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST]),
    );

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .map_err(|e| GatewayError::Config(format!("cannot bind {bind_address}: {e}")))?;

    info!("API listening on http://{}", bind_address);
    info!("Health check: http://{}/health", bind_address);
    info!("OpenAPI spec: http://{}/api-docs/openapi.json", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| GatewayError::internal(format!("HTTP server error: {e}")))?;

    info!("Shutting down");
    match Arc::try_unwrap(controller) {
        Ok(controller) => controller.shutdown().await,
        Err(_) => error!("Controller still referenced at shutdown"),
    }
    info!("Gateway shutdown completed");

    Ok(())
}

/// Console + daily-rotated file logging.
fn init_tracing(
    log_dir: &str,
    level: &str,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .map_err(|e| GatewayError::Config(format!("cannot create log dir {log_dir}: {e}")))?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "gm3srv.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(std::io::stdout.and(non_blocking))
        .with_env_filter(filter)
        .with_target(false)
        .init();

    Ok(guard)
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Failed to listen for shutdown signal: {e}"),
    }
}
