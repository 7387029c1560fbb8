// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//!
//! `lexis` - inspect and maintain a Lexis store on disk.
//!
//! Opens a redb file, restores every persistent collection and the pending
//! sync queue, runs one command, and flushes before exiting when the
//! command changed anything.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use lexis_engine::{EngineConfig, HttpRemote, SetOptions, Snapshot, StoreBuilder, StoreManager};
use lexis_storage::RedbBackend;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// CLI argument parsing
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "lexis", version = VERSION, about = "Lexis data engine store tool")]
struct Cli {
    /// Path of the redb store file (created if missing).
    #[arg(long, default_value = "lexis.redb")]
    db: PathBuf,

    /// Key namespace; overrides the configured one.
    #[arg(long)]
    namespace: Option<String>,

    /// JSON engine configuration. Defaults plus `LEXIS_*` variables otherwise.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Remote endpoint that pending sync operations are replayed against.
    #[arg(long)]
    sync_endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print engine statistics as JSON.
    Stats,
    /// List the configured collections.
    Collections,
    /// Print one value.
    Get { collection: String, key: String },
    /// Print every live entry of a collection.
    List { collection: String },
    /// Store a JSON value (bare words are stored as strings).
    Set {
        collection: String,
        key: String,
        value: String,
        /// Expire after this many milliseconds.
        #[arg(long)]
        ttl_ms: Option<u64>,
        /// Flush the collection right away.
        #[arg(long)]
        immediate: bool,
    },
    /// Remove one key.
    Delete { collection: String, key: String },
    /// Remove every entry of a collection.
    Clear { collection: String },
    /// Drop expired entries everywhere.
    Purge,
    /// Write a snapshot of every collection.
    Export {
        /// Output file; stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Load a snapshot written by `export`.
    Import { file: PathBuf },
    /// Replay the pending sync queue (needs --sync-endpoint).
    Sync,
    /// Show pending and dead-lettered sync operations.
    Queue,
    /// Run the periodic scheduler until interrupted.
    Run,
}

impl Command {
    fn mutates(&self) -> bool {
        matches!(
            self,
            Command::Set { .. }
                | Command::Delete { .. }
                | Command::Clear { .. }
                | Command::Purge
                | Command::Import { .. }
                | Command::Sync
        )
    }
}

// ---------------------------------------------------------------------------
// Store setup
// ---------------------------------------------------------------------------

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            EngineConfig::from_json_str(&raw)?
        }
        None => EngineConfig::from_env()?,
    };
    if let Some(namespace) = &cli.namespace {
        config.namespace = namespace.clone();
    }
    Ok(config)
}

fn open_store(cli: &Cli) -> Result<StoreManager<RedbBackend>> {
    let config = load_config(cli)?;
    let backend = RedbBackend::open(&cli.db)
        .with_context(|| format!("opening store {}", cli.db.display()))?;

    let mut builder = StoreBuilder::new(config, backend);
    if let Some(endpoint) = &cli.sync_endpoint {
        builder = builder.remote(Arc::new(HttpRemote::new(endpoint)?));
    }
    Ok(builder.build()?)
}

/// Accept JSON, falling back to a plain string for bare words.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn execute(store: &StoreManager<RedbBackend>, cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Stats => print_json(&store.stats())?,
        Command::Collections => {
            for spec in &store.config().collections {
                println!("{}\t{}", spec.name, serde_json::to_string(&spec.config)?);
            }
        }
        Command::Get { collection, key } => match store.get_value(collection, key).await? {
            Some(value) => print_json(&value)?,
            None => bail!("{collection}/{key} not found"),
        },
        Command::List { collection } => print_json(&store.get_all(collection).await?)?,
        Command::Set {
            collection,
            key,
            value,
            ttl_ms,
            immediate,
        } => {
            let mut options = SetOptions::default();
            if let Some(ttl) = ttl_ms {
                options = options.with_ttl(*ttl);
            }
            options.immediate = *immediate;
            store.set(collection, key, &parse_value(value), options).await?;
        }
        Command::Delete { collection, key } => {
            if !store.delete(collection, key).await? {
                eprintln!("{collection}/{key} was not present");
            }
        }
        Command::Clear { collection } => {
            let removed = store.clear(collection).await?;
            println!("removed {removed} entries");
        }
        Command::Purge => {
            let purged = store.purge_expired();
            println!("purged {purged} expired entries");
        }
        Command::Export { out } => {
            let snapshot = store.export_snapshot().await;
            let json = serde_json::to_string_pretty(&snapshot)?;
            match out {
                Some(path) => std::fs::write(path, json)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => println!("{json}"),
            }
        }
        Command::Import { file } => {
            let raw = std::fs::read_to_string(file)
                .with_context(|| format!("reading {}", file.display()))?;
            let snapshot: Snapshot = serde_json::from_str(&raw).context("parsing snapshot")?;
            let report = store.import_snapshot(snapshot).await?;
            print_json(&report)?;
        }
        Command::Sync => {
            if cli.sync_endpoint.is_none() {
                bail!("sync needs --sync-endpoint");
            }
            print_json(&store.drain_sync().await)?;
        }
        Command::Queue => {
            print_json(&serde_json::json!({
                "pending": store.pending_sync(),
                "deadLetters": store.dead_letters(),
            }))?;
        }
        Command::Run => {
            let scheduler = store.spawn_scheduler();
            tracing::info!(
                interval_ms = store.config().flush_interval_ms,
                "Scheduler running, Ctrl-C to stop"
            );
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            scheduler.shutdown().await;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let store = open_store(&cli)?;
    store.restore().await;

    execute(&store, &cli).await?;

    if cli.command.mutates() {
        let report = store.flush_all().await;
        if !report.failed.is_empty() {
            bail!("failed to flush: {}", report.failed.join(", "));
        }
    }
    Ok(())
}
