// ABOUTME: Entry point for the beacon binary.
// ABOUTME: Parses CLI arguments, initializes tracing, and drives the delivery channel against a SQLite store.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use beacon_channel::{ChannelBuilder, ChannelHandle};
use beacon_core::{Log, LogStore};
use beacon_store::SqliteLogStore;
use beacon_transport::{DefaultHttpClient, IngestionHttp};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::config::BeaconConfig;

#[derive(Parser)]
#[command(name = "beacon", version, about = "Batch and deliver telemetry records")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue JSON records (one object per line) and deliver them
    Send {
        /// Group the records belong to
        #[arg(long, default_value = "events")]
        group: String,
        /// Read records from this file instead of stdin
        #[arg(long)]
        file: Option<PathBuf>,
        /// How long to wait for the backlog to drain before exiting
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },
    /// Print persisted record counts per configured group
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("beacon=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = BeaconConfig::from_env()?;

    match cli.command {
        Commands::Send {
            group,
            file,
            wait_secs,
        } => send(&config, &group, file, Duration::from_secs(wait_secs)).await,
        Commands::Status => status(&config),
    }
}

fn open_store(config: &BeaconConfig) -> anyhow::Result<Arc<SqliteLogStore>> {
    std::fs::create_dir_all(&config.home)
        .with_context(|| format!("creating {}", config.home.display()))?;
    let store = SqliteLogStore::open(&config.db_path())?;
    Ok(Arc::new(store))
}

async fn start_channel(
    config: &BeaconConfig,
    store: Arc<SqliteLogStore>,
) -> anyhow::Result<ChannelHandle> {
    let client = Arc::new(
        DefaultHttpClient::builder()
            .https_only(!config.allow_insecure)
            .build()?,
    );
    let ingestion = match &config.log_url {
        Some(url) => IngestionHttp::with_log_url(client, url),
        None => IngestionHttp::new(client),
    };

    let mut builder = ChannelBuilder::new(store, Arc::new(ingestion))
        .install_id(config.resolve_install_id()?);
    match &config.app_secret {
        Some(secret) => builder = builder.app_secret(secret),
        None => tracing::warn!("BEACON_APP_SECRET is not set, records will be dropped"),
    }

    let handle = builder.spawn();
    for entry in &config.groups {
        handle.add_group(entry.to_config()).await?;
    }
    Ok(handle)
}

fn parse_record(line: &str) -> Option<Log> {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("skipping invalid JSON line: {}", e);
            return None;
        }
    };
    let Value::Object(mut properties) = value else {
        tracing::warn!("skipping line that is not a JSON object");
        return None;
    };

    let log_type = properties
        .remove("type")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "event".to_string());
    let mut log = Log::new(log_type);
    log.properties = properties;
    Some(log)
}

async fn send(
    config: &BeaconConfig,
    group: &str,
    file: Option<PathBuf>,
    wait: Duration,
) -> anyhow::Result<()> {
    if !config.groups.iter().any(|g| g.name == group) {
        anyhow::bail!("group '{}' is not configured", group);
    }

    let store = open_store(config)?;
    let handle = start_channel(config, Arc::clone(&store)).await?;

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &file {
        Some(path) => Box::new(BufReader::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let mut lines = reader.lines();
    let mut enqueued = 0usize;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(log) = parse_record(line) {
            handle.enqueue(log, group).await?;
            enqueued += 1;
        }
    }
    tracing::info!(group = %group, enqueued, "records enqueued");

    let deadline = tokio::time::Instant::now() + wait;
    while store.count(group)? > 0 && handle.is_enabled().await? {
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    handle.shutdown().await?;
    let remaining = store.count(group)?;
    if remaining > 0 {
        tracing::warn!(group = %group, remaining, "records still queued, they will be retried on the next run");
    } else {
        tracing::info!(group = %group, "backlog delivered");
    }
    Ok(())
}

fn status(config: &BeaconConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    for entry in &config.groups {
        println!("{}\t{}", entry.name, store.count(&entry.name)?);
    }
    Ok(())
}
