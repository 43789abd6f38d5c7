//! CLI entry point for chunkstore-meta: offline metadata maintenance.

use std::path::PathBuf;
use std::sync::Arc;

use chunkstore::config::{load_config, Config};
use chunkstore::metadata::sqlite::SqliteMetadataStore;
use chunkstore::metadata::store::MetadataStore;
use chunkstore::quota::QuotaGuard;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "chunkstore-meta", about = "ChunkStore metadata maintenance tool")]
struct Cli {
    #[arg(long, global = true, default_value = "config.yaml")]
    config: PathBuf,
    /// SQLite file, overriding metadata.sqlite.path from the config.
    #[arg(long, global = true)]
    db: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild used_bytes from object sizes
    Recompute {
        /// Only this owner.
        #[arg(long)]
        owner: Option<String>,
    },
    /// Print orphaned objects as JSON lines
    Orphans,
    /// Set an owner's quota limit
    SetQuota {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        bytes: u64,
    },
}

fn resolve(config_path: &PathBuf, db: Option<String>) -> Result<(Config, String), Box<dyn std::error::Error>> {
    let config = if config_path.exists() {
        load_config(config_path)?
    } else {
        Config::default()
    };
    let db_path = db.unwrap_or_else(|| config.metadata.sqlite.path.clone());
    Ok((config, db_path))
}

fn main() {
    let cli = Cli::parse();
    let (config, db_path) = match resolve(&cli.config, cli.db) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error reading config: {}", e);
            std::process::exit(1);
        }
    };
    let store = match SqliteMetadataStore::new(&db_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("Error opening {}: {}", db_path, e);
            std::process::exit(1);
        }
    };
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error starting runtime: {}", e);
            std::process::exit(1);
        }
    };

    let rc = runtime.block_on(async {
        match cli.command {
            Commands::Recompute { owner } => run_recompute(&config, store, owner).await,
            Commands::Orphans => run_orphans(store).await,
            Commands::SetQuota { owner, bytes } => run_set_quota(store, &owner, bytes).await,
        }
    });
    std::process::exit(rc);
}

async fn run_recompute(config: &Config, store: Arc<SqliteMetadataStore>, owner: Option<String>) -> i32 {
    let guard = QuotaGuard::new(store, &config.quota);
    let result = match owner {
        Some(owner) => guard.recompute_usage(&owner).await.map(|q| vec![q]),
        None => guard.recompute_all().await,
    };
    match result {
        Ok(quotas) => {
            for q in quotas {
                println!("{}\t{}/{}", q.owner_id, q.used_bytes, q.quota_bytes);
            }
            0
        }
        Err(e) => {
            eprintln!("Error recomputing usage: {}", e);
            1
        }
    }
}

async fn run_orphans(store: Arc<SqliteMetadataStore>) -> i32 {
    let orphans = match store.list_orphans().await {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error listing orphans: {}", e);
            return 1;
        }
    };
    for orphan in orphans {
        match serde_json::to_string(&orphan) {
            Ok(line) => println!("{}", line),
            Err(e) => {
                eprintln!("Error encoding orphan: {}", e);
                return 1;
            }
        }
    }
    0
}

async fn run_set_quota(store: Arc<SqliteMetadataStore>, owner: &str, bytes: u64) -> i32 {
    if let Err(e) = chunkstore::naming::validate_owner_id(owner) {
        eprintln!("Error: {}", e);
        return 1;
    }
    match store.set_quota_limit(owner, bytes).await {
        Ok(q) => {
            println!("{}\t{}/{}", q.owner_id, q.used_bytes, q.quota_bytes);
            if q.used_bytes > q.quota_bytes {
                eprintln!("Warning: {} is already over the new limit", q.owner_id);
            }
            0
        }
        Err(e) => {
            eprintln!("Error setting quota: {}", e);
            1
        }
    }
}
