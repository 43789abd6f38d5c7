//! ChunkStore -- chunked-upload and resumable-download server.
//!
//! Crash-only design: every startup is a recovery. There is no separate
//! recovery mode. Upload sessions live in memory and are lost on restart;
//! clients re-send from index 0. SIGTERM/SIGINT handlers only stop
//! accepting connections and wait with a timeout before exiting.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use chunkstore::config::Config;
use chunkstore::metadata::store::MetadataStore;
use chunkstore::storage::backend::StorageBackend;

/// Command-line arguments for the ChunkStore server.
#[derive(Parser, Debug)]
#[command(
    name = "chunkstore",
    version,
    about = "Chunked-upload and resumable-download file store"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Override server.host from the config.
    #[arg(long)]
    host: Option<String>,

    /// Override server.port from the config.
    #[arg(short, long)]
    port: Option<u16>,
}

/// Load the config file, or the built-in defaults when it does not exist,
/// then apply the command-line overrides.
fn resolve_config(cli: &Cli) -> anyhow::Result<(Config, bool)> {
    let from_file = std::path::Path::new(&cli.config).exists();
    let mut config = if from_file {
        chunkstore::config::load_config(&cli.config)?
    } else {
        Config::default()
    };
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    Ok((config, from_file))
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_metadata(config: &Config) -> anyhow::Result<Arc<dyn MetadataStore>> {
    match config.metadata.engine.as_str() {
        "memory" => {
            info!("In-memory metadata store initialized");
            Ok(Arc::new(chunkstore::metadata::memory::MemoryMetadataStore::new()))
        }
        "sqlite" => {
            let metadata_path = &config.metadata.sqlite.path;
            // Ensure parent directory exists for the SQLite file.
            if let Some(parent) = std::path::Path::new(metadata_path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            let store = chunkstore::metadata::sqlite::SqliteMetadataStore::new(metadata_path)?;
            info!("SQLite metadata store initialized at {}", metadata_path);
            Ok(Arc::new(store))
        }
        other => anyhow::bail!("unknown metadata.engine '{other}' (expected sqlite or memory)"),
    }
}

fn open_storage(config: &Config) -> anyhow::Result<Arc<dyn StorageBackend>> {
    match config.storage.backend.as_str() {
        "memory" => {
            let memory = &config.storage.memory;
            info!(
                "Memory storage backend initialized: max_size_bytes={} read_chunk_bytes={}",
                memory.max_size_bytes, memory.read_chunk_bytes
            );
            Ok(Arc::new(chunkstore::storage::memory::MemoryBackend::new(
                memory.max_size_bytes,
                memory.read_chunk_bytes,
            )))
        }
        "azure" => {
            let azure_config = config.storage.azure.as_ref().ok_or_else(|| {
                anyhow::anyhow!("storage.backend is 'azure' but storage.azure config section is missing")
            })?;
            let backend = chunkstore::storage::azure::AzureBlobBackend::new(azure_config)?;
            info!(
                "Azure storage backend initialized: container={} account={} prefix='{}'",
                azure_config.container, azure_config.account, azure_config.prefix
            );
            Ok(Arc::new(backend))
        }
        other => anyhow::bail!("unknown storage.backend '{other}' (expected memory or azure)"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (config, from_file) = resolve_config(&cli)?;
    init_tracing(&config);
    if from_file {
        info!("Loaded configuration from {}", cli.config);
    } else {
        warn!("{} not found, using built-in defaults", cli.config);
    }

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    // Crash-only startup: every startup IS recovery.
    info!("Crash-only startup: performing recovery checks");

    if config.observability.metrics {
        chunkstore::metrics::init_metrics();
        chunkstore::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let metadata = open_metadata(&config)?;
    let storage = open_storage(&config)?;

    let recompute = config.quota.recompute_on_startup;
    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    let state = Arc::new(chunkstore::AppState::assemble(config, metadata, storage));

    if recompute {
        let quotas = state.quota.recompute_all().await?;
        info!("Quota usage recomputed for {} owners", quotas.len());
    }
    let orphans = state.metadata.list_orphans().await?;
    if !orphans.is_empty() {
        warn!(
            "{} orphaned objects await reconciliation (see chunkstore-meta orphans)",
            orphans.len()
        );
    }

    let app = chunkstore::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("ChunkStore listening on {}", bind_addr);

    // Graceful shutdown: on SIGTERM/SIGINT, stop accepting new connections,
    // then give in-flight requests `shutdown_timeout` to finish.
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    tokio::select! {
        result = server => result?,
        _ = async {
            shutdown_signal().await;
            tokio::time::sleep(shutdown_timeout).await;
        } => warn!("Shutdown timeout elapsed, exiting with requests in flight"),
    }

    info!("ChunkStore shut down");

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
