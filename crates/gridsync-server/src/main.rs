//! Gridsync server binary.
//!
//! # Usage
//!
//! ```bash
//! # Durable store in ./gridsync.redb
//! gridsync-server --bind 0.0.0.0:2112
//!
//! # Throwaway in-memory store
//! gridsync-server --in-memory --log-level debug
//! ```

use std::path::PathBuf;

use clap::Parser;
use gridsync_proto::DecoderConfig;
use gridsync_server::{
    DocumentStore, DriverConfig, MemoryStore, RedbStore, Server, ServerError, ServerRuntimeConfig,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Gridsync collaborative spreadsheet server
#[derive(Parser, Debug)]
#[command(name = "gridsync-server")]
#[command(about = "Collaborative spreadsheet document server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:2112")]
    bind: String,

    /// Path to the document database
    #[arg(short, long, default_value = "gridsync.redb")]
    data: PathBuf,

    /// Keep documents in memory only (lost on exit)
    #[arg(long, conflicts_with = "data")]
    in_memory: bool,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Largest accepted cell content in bytes
    #[arg(long, default_value = "16777216")]
    max_blob_len: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Durable store location, or `None` for the in-memory store.
    fn data_path(&self) -> Option<PathBuf> {
        (!self.in_memory).then(|| self.data.clone())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Gridsync server starting");
    tracing::info!("Binding to {}", args.bind);

    let data_path = args.data_path();
    let config = ServerRuntimeConfig {
        bind_address: args.bind,
        decoder: DecoderConfig { max_blob_len: args.max_blob_len, ..Default::default() },
        driver: DriverConfig { max_connections: args.max_connections },
    };

    match data_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "opening document store");
            let store = RedbStore::open(&path)?;
            serve(config, store).await?;
        },
        None => {
            tracing::warn!("In-memory store: documents are lost on exit");
            serve(config, MemoryStore::new()).await?;
        },
    }

    Ok(())
}

async fn serve<S: DocumentStore>(config: ServerRuntimeConfig, store: S) -> Result<(), ServerError> {
    let server = Server::bind(config, store).await?;

    tracing::info!("Server listening on {}", server.local_addr()?);

    server.run_until(shutdown_signal()).await
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(e) => {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        },
    }
}
