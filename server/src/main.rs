//! Mainframe Hub binary.
//!
//! Starts the hub on an in-memory store with:
//! - JSON logs filtered by `RUST_LOG`
//! - A periodic sweep of idle rate-limit buckets
//! - Graceful shutdown on SIGINT or SIGTERM
//!
//! # Configuration
//!
//! See [`mainframe_hub::config`] for the environment variables.
//!
//! # Example
//!
//! ```bash
//! MAINFRAME_ADMIN_TOKEN="admin-secret" \
//! PORT=8080 \
//! cargo run --release --bin mainframe-hub
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use mainframe_hub::config::Config;
use mainframe_hub::routes::{create_router, AppState};
use mainframe_hub::store::MemoryStore;

/// How often idle rate-limit buckets are swept.
const QUOTA_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

const DEFAULT_LOG_FILTER: &str = "info,tower_http=debug,axum::rejection=trace";

const ENV_HELP: &[(&str, &str)] = &[
    ("PORT", "HTTP server port (default: 8080)"),
    ("RUST_LOG", "Log level filter (default: info)"),
    ("MAINFRAME_ADMIN_TOKEN", "Enables POST /api/v1/keys"),
    ("MAINFRAME_AVATAR_URL", "Avatar base URL for roster entries"),
    ("MAINFRAME_EGRESS_CAPACITY", "Outbound frames queued per session"),
    ("MAINFRAME_INGRESS_CAPACITY", "Inbound envelopes queued for the router"),
];

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Invalid hub configuration");
            eprintln!("Error: {err}\n\nEnvironment variables:");
            for (name, meaning) in ENV_HELP {
                eprintln!("  {name:<28}- {meaning}");
            }
            return ExitCode::from(2);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "Hub stopped with an error");
            ExitCode::FAILURE
        }
    }
}

/// Serves the hub until a shutdown signal arrives.
async fn run(config: Config) -> std::io::Result<()> {
    info!(
        port = config.port,
        key_issuance = config.admin_token.is_some(),
        egress_capacity = config.egress_capacity,
        ingress_capacity = config.ingress_capacity,
        "Mainframe hub starting"
    );

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!(address = %bind_addr, "Listening for bots and clients");

    let state = AppState::new(config, Arc::new(MemoryStore::new()));
    let sweeper = state.rate_limiter.spawn_cleanup_task(QUOTA_SWEEP_INTERVAL);
    let registry = state.registry.clone();

    let result = axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    sweeper.abort();
    info!(open_sessions = registry.len(), "Mainframe hub stopped");
    result
}

fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_file(false)
                .with_line_number(false),
        )
        .init();
}

/// Resolves on SIGINT, or on SIGTERM where supported.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let source = tokio::select! {
        _ = interrupt => "SIGINT",
        _ = terminate => "SIGTERM",
    };
    info!(signal = source, "Shutdown requested, draining connections");
}
