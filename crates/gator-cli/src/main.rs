mod commands;
mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gator::{
    BucketId, BucketManager, BucketRef, DEFAULT_CONCURRENCY, MemoryStorage, RecordStorage,
    Repolist, SyncEngine, SyncOptions,
};
use gator_store::{DiskStorage, SqliteCanonicalStore};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{AppConfig, StorageBackend};

#[derive(Parser)]
#[command(name = "gator")]
#[command(about = "Pull monitored datasets into versioned buckets and sync them into the canonical store")]
struct Cli {
    /// Configuration file (defaults to ~/.config/gator/gator.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch every enabled repository into a new bucket
    Pull {
        /// Only pull the repository with this id (repeatable)
        #[arg(long)]
        only: Vec<String>,
    },
    /// Reconcile a bucket into the canonical store
    Sync {
        /// Bucket id (defaults to the latest bucket)
        bucket: Option<String>,
        /// Rewrite documents even when their fingerprint matches
        #[arg(long)]
        force: bool,
        /// Number of keys written concurrently
        #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
        concurrency: usize,
    },
    /// Delete canonical documents that are not in a bucket
    Prune {
        /// Bucket id (defaults to the latest bucket)
        bucket: Option<String>,
    },
    /// Validate the repolist against the available dataset types
    Check,
    /// Inspect and manage buckets
    Buckets {
        #[command(subcommand)]
        command: BucketsCommand,
    },
    /// Inspect records in a bucket
    Records {
        #[command(subcommand)]
        command: RecordsCommand,
    },
}

#[derive(Subcommand)]
enum BucketsCommand {
    /// List sealed buckets, oldest first
    List,
    /// Show a bucket's metadata and per-repository outcomes
    Show {
        /// Bucket id or `latest`
        id: String,
    },
    /// Delete a bucket and its records
    Delete { id: String },
    /// Discard buckets left unsealed by interrupted pulls
    Gc,
}

#[derive(Subcommand)]
enum RecordsCommand {
    /// List the keys in a bucket
    List {
        /// Bucket id or `latest`
        bucket: String,
    },
    /// Print one record's payload
    Show {
        /// Bucket id or `latest`
        bucket: String,
        key: String,
    },
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,gator=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn bucket_ref(arg: Option<&str>) -> BucketRef {
    match arg {
        None | Some("latest") => BucketRef::Latest,
        Some(id) => BucketRef::Id(BucketId::new(id)),
    }
}

fn open_storage(config: &AppConfig) -> Result<Arc<dyn RecordStorage>> {
    match config.storage.backend {
        StorageBackend::Disk => {
            let root = config.storage_root()?;
            debug!(root = %root.display(), "opening disk storage");
            let storage = DiskStorage::open(&root)
                .with_context(|| format!("failed to open record storage at {}", root.display()))?;
            Ok(Arc::new(storage))
        }
        StorageBackend::Memory => {
            warn!("using in-memory record storage; buckets are discarded on exit");
            Ok(Arc::new(MemoryStorage::new()))
        }
    }
}

fn open_canonical(config: &AppConfig) -> Result<SqliteCanonicalStore> {
    let path = config.canonical_path()?;
    debug!(path = %path.display(), "opening canonical store");
    SqliteCanonicalStore::open(&path)
        .with_context(|| format!("failed to open canonical store at {}", path.display()))
}

fn load_repolist(config: &AppConfig) -> Result<Repolist> {
    config.repolist().context("invalid repolist")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut app_config = config::load_config(cli.config.as_deref())?;
    app_config.apply_env(|name| std::env::var(name).ok())?;

    let registry = gator_datasets::builtin_registry();

    match cli.command {
        Command::Pull { only } => {
            let repolist = load_repolist(&app_config)?;
            let buckets = BucketManager::new(open_storage(&app_config)?);
            commands::pull::run(&buckets, &registry, &repolist, only).await
        }
        Command::Sync {
            bucket,
            force,
            concurrency,
        } => {
            let buckets = BucketManager::new(open_storage(&app_config)?);
            let store = open_canonical(&app_config)?;
            let engine = SyncEngine::new(&buckets, &store);
            let options = SyncOptions { force, concurrency };
            commands::sync::run(&engine, &bucket_ref(bucket.as_deref()), &options).await
        }
        Command::Prune { bucket } => {
            let buckets = BucketManager::new(open_storage(&app_config)?);
            let store = open_canonical(&app_config)?;
            let engine = SyncEngine::new(&buckets, &store);
            commands::prune::run(&engine, &bucket_ref(bucket.as_deref())).await
        }
        Command::Check => {
            let repolist = load_repolist(&app_config)?;
            commands::check::run(&repolist, &registry)
        }
        Command::Buckets { command } => {
            let buckets = BucketManager::new(open_storage(&app_config)?);
            match command {
                BucketsCommand::List => commands::buckets::list(&buckets).await,
                BucketsCommand::Show { id } => {
                    commands::buckets::show(&buckets, &bucket_ref(Some(&id))).await
                }
                BucketsCommand::Delete { id } => commands::buckets::delete(&buckets, &id).await,
                BucketsCommand::Gc => commands::buckets::gc(&buckets).await,
            }
        }
        Command::Records { command } => {
            let buckets = BucketManager::new(open_storage(&app_config)?);
            match command {
                RecordsCommand::List { bucket } => {
                    commands::records::list(&buckets, &bucket_ref(Some(&bucket))).await
                }
                RecordsCommand::Show { bucket, key } => {
                    commands::records::show(&buckets, &bucket_ref(Some(&bucket)), &key).await
                }
            }
        }
    }
}
