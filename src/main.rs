//! webpipes (v1)
//!
//! An HTTP server whose routes are pipelines of small stages, built with
//! Tokio and Axum.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ─────────────────▶ http server ──▶ route table ──▶ Handler
//!                        (axum, layers)   (longest match)   │
//!                                                           ├─ Chain (inline)
//!                                                           └─ Network (staged workers,
//!                                                                bounded queues)
//!                                                                   │
//!                          Source ──▶ Filter ... ──▶ Pipe ──▶ output stage
//!                        (text, file,  (rot13,     (auth,
//!                         cgi, ...)     gzip, ...)  access log)
//!     Client Response                                               │
//!     ◀────────────────── Connection::into_response ◀───────────────┘
//!
//!     Cross-cutting: config (TOML + hot reload), observability (tracing,
//!     Prometheus), lifecycle (signals, graceful shutdown)
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use webpipes::config::{load_config, ConfigWatcher, ServerConfig};
use webpipes::http::HttpServer;
use webpipes::lifecycle::{spawn_signal_handler, Shutdown};
use webpipes::observability::{logging, metrics};

#[derive(Parser, Debug)]
#[command(name = "webpipes", version)]
#[command(about = "HTTP server built from composable pipeline stages", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the listener bind address
    #[arg(short, long, value_name = "ADDR")]
    bind: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }

    if cli.check {
        webpipes::routing::build_routes(&config)?;
        println!("configuration ok: {} routes, {} networks", config.routes.len(), config.networks.len());
        return Ok(());
    }

    logging::init_logging(&config.observability.log_level);
    tracing::info!("webpipes v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        bind_address = %config.listener.bind_address,
        routes = config.routes.len(),
        networks = config.networks.len(),
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    // Keep the watcher alive for the lifetime of the server.
    let (config_updates, _watcher) = match &cli.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path, &config);
            match watcher.run() {
                Ok(handle) => (updates, Some(handle)),
                Err(e) => {
                    tracing::warn!(error = %e, "Config hot reload disabled");
                    (mpsc::unbounded_channel().1, None)
                }
            }
        }
        None => (mpsc::unbounded_channel().1, None),
    };

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    spawn_signal_handler(&shutdown);

    let server = HttpServer::new(config)?;
    server.run(listener, config_updates, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
