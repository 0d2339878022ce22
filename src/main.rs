//! Message relay server.
//!
//! ```text
//!                    ┌──────────────────────────────────────────────────────┐
//!                    │                        RELAY                         │
//!   Peer (client) ───┼─▶ http::websocket ─▶ Correlator ─▶ pipeline ─▶ dispatch │
//!                    │                          ▲                     │    │
//!                    │                          │ replies             ▼    │
//!   Peer (host)  ◀───┼── Correlator ◀── RemoteExecutor ◀── ServiceQueue    │
//!                    │                                        (worker pool)│
//!                    │  config · health · lifecycle · observability       │
//!                    └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use relay_server::config::{load_config, validate_config, ConfigError, ConfigWatcher, RelayConfig};
use relay_server::lifecycle::shutdown_signal;
use relay_server::observability::{logging, metrics};
use relay_server::RelayServer;

#[derive(Parser)]
#[command(name = "relay-server")]
#[command(about = "Service relay over WebSocket", long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,

    /// Reload the configuration file when it changes.
    #[arg(short, long, requires = "config")]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => RelayConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }
    validate_config(&config).map_err(ConfigError::Validation)?;

    logging::init_logging(&config.observability)?;
    tracing::info!("relay-server v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        request_timeout_secs = config.timeouts.request_secs,
        workers = config.services.effective_workers(),
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

    // Kept alive for the life of the server.
    let mut _watcher = None;
    let updates = match (&cli.config, cli.watch) {
        (Some(path), true) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            _watcher = Some(watcher.run()?);
            Some(updates)
        }
        _ => None,
    };

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let server = RelayServer::new(config)?;
    server.run(listener, updates, shutdown_signal()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
