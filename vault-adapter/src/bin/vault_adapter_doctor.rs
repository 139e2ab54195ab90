//! vault-adapter doctor
//!
//! Operator tool for the dual-tier storage adapter: validates configuration, probes the
//! remote vault, scans text for PII and replays a spill file left by a shutdown.

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use vault_adapter::queue::spill;
use vault_adapter::{
    AdapterStats, DualStorageAdapter, HttpVaultClient, InMemoryGraphStore, PiiDetector,
    StorageConfig, VaultClient,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML config file; VAULT_ADAPTER_* environment variables are applied on top
    #[arg(short, long, env = "VAULT_ADAPTER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the configuration, then print it with secrets redacted
    Check,

    /// Run the remote vault health check
    Health,

    /// Detect PII in a file (or stdin) and print counts per type
    Scan {
        /// File to scan; reads stdin when omitted
        #[arg(value_name = "FILE")]
        input: Option<PathBuf>,
    },

    /// Load a spill file into the retry queue and flush it against the vault
    ReplaySpill {
        /// Spill file; defaults to performance.spill_path
        #[arg(value_name = "FILE")]
        path: Option<PathBuf>,

        /// Overall deadline for the flush, in seconds
        #[arg(long, default_value_t = 60)]
        deadline_secs: u64,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<StorageConfig> {
    let mut config = match path {
        Some(path) => StorageConfig::from_file(path).map_err(|e| anyhow!(e))?,
        None => StorageConfig::default(),
    };
    config
        .apply_env_overrides()
        .map_err(|errors| anyhow!("invalid environment overrides: {}", errors.join("; ")))?;
    Ok(config)
}

fn validated(config: &StorageConfig) -> anyhow::Result<()> {
    config
        .validate()
        .map_err(|errors| anyhow!("invalid configuration:\n  - {}", errors.join("\n  - ")))
}

async fn health(config: StorageConfig) -> anyhow::Result<()> {
    validated(&config)?;
    if !config.enabled {
        bail!("vault is disabled (enabled = false)");
    }
    let client = HttpVaultClient::from_config(&config)?;
    let healthy = client
        .health_check()
        .await
        .with_context(|| format!("health check against {} failed", config.remote_endpoint))?;
    if !healthy {
        bail!("vault at {} reports unhealthy", config.remote_endpoint);
    }
    println!("vault at {} is healthy", config.remote_endpoint);
    Ok(())
}

fn scan(config: &StorageConfig, input: Option<&PathBuf>) -> anyhow::Result<()> {
    let text = match input {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let detector = PiiDetector::new(&config.anonymization).map_err(|e| anyhow!(e))?;
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for detection in detector.detect(&text) {
        *counts.entry(detection.pii_type.tag()).or_default() += 1;
    }
    if counts.is_empty() {
        println!("no PII detected");
        return Ok(());
    }
    for (tag, count) in &counts {
        println!("{:<24} {}", tag, count);
    }
    println!("{:<24} {}", "TOTAL", counts.values().sum::<usize>());
    Ok(())
}

async fn replay_spill(
    mut config: StorageConfig,
    path: Option<PathBuf>,
    deadline: Duration,
) -> anyhow::Result<()> {
    let path = path
        .or_else(|| config.performance.spill_path.clone())
        .ok_or_else(|| anyhow!("no spill file given and performance.spill_path is not set"))?;
    let pending = spill::read_spill(&path)
        .with_context(|| format!("failed to read spill file {}", path.display()))?
        .map_or(0, |ops| ops.len());
    if pending == 0 {
        println!("nothing to replay in {}", path.display());
        return Ok(());
    }
    config.performance.spill_path = Some(path.clone());
    validated(&config)?;

    let vault = HttpVaultClient::from_config(&config)?;
    // The adapter reloads the spill file on construction and re-spills what is left.
    let adapter = DualStorageAdapter::new(
        config,
        Arc::new(InMemoryGraphStore::new()),
        Arc::new(vault),
        AdapterStats::new(),
    )?;
    info!("Replaying {} spilled operations from {}", pending, path.display());
    let report = adapter.flush_archival_queue().await?;
    let shutdown = adapter.shutdown(deadline).await;

    println!("archived:           {}", report.archive_ids.len());
    println!("requeued:           {}", report.requeued);
    println!("permanent failures: {}", report.permanent_failures.len());
    for failure in &report.permanent_failures {
        println!(
            "  session {} ({:?}) after {} attempts: {}",
            failure.session_id, failure.kind, failure.attempts, failure.error
        );
    }
    println!("re-spilled:         {}", shutdown.spilled);
    if shutdown.lost > 0 {
        bail!("{} operations could not be written back to the spill file", shutdown.lost);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vault_adapter=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Check => {
            validated(&config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!("configuration OK");
        }
        Commands::Health => health(config).await?,
        Commands::Scan { input } => scan(&config, input.as_ref())?,
        Commands::ReplaySpill {
            path,
            deadline_secs,
        } => replay_spill(config, path, Duration::from_secs(deadline_secs)).await?,
    }
    Ok(())
}
