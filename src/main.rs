use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{GatekeeperConfig, StoreBackend};
use gatekeeper::http::{status_router, AdmissionState, HttpServer};
use gatekeeper::ratelimit::{JsonFileStore, Limiter, MemoryStore, StateStore, SystemClock};

/// Fixed-window admission control in front of an HTTP service.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "GATEKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(long)]
    http_addr: Option<std::net::SocketAddr>,

    /// Requests admitted per window per client
    #[arg(long)]
    limit: Option<u64>,

    /// Window size in milliseconds
    #[arg(long)]
    window_ms: Option<u64>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = GatekeeperConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.http_addr {
        config.server.http_addr = addr;
    }
    if let Some(limit) = cli.limit {
        config.rate_limiting.limit = limit;
    }
    if let Some(window_ms) = cli.window_ms {
        config.rate_limiting.window_duration_ms = window_ms;
    }
    config.logging.json |= cli.log_json;
    config.validate()?;

    init_tracing(config.logging.json);

    info!("Starting Gatekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        http_addr = %config.server.http_addr,
        limit = config.rate_limiting.limit,
        window_duration_ms = config.rate_limiting.window_duration_ms,
        consistency = ?config.rate_limiting.consistency,
        "Configuration loaded"
    );

    let store: Arc<dyn StateStore> = match config.store.backend {
        StoreBackend::File => {
            let store = JsonFileStore::new(&config.store.path);
            if config.store.create_if_missing {
                store.initialize().await?;
            }
            info!(path = %store.path().display(), "Using file state store");
            Arc::new(store)
        }
        StoreBackend::Memory => {
            info!("Using in-memory state store");
            Arc::new(MemoryStore::new())
        }
    };

    let limiter = Arc::new(Limiter::new(store, config.rate_limiting.clone())?);
    let state = AdmissionState::new(limiter, Arc::new(SystemClock))
        .trust_forwarded_headers(config.server.trust_forwarded_headers);

    let server = HttpServer::new(config.server.http_addr, state, status_router());

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Gatekeeper stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
