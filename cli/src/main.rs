mod config;
mod script;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::CliConfig;
use script::{run_script, Step, StepOutcome};
use strata_kernel::log::InMemoryLog;
use strata_kernel::{spawn_purge_deletes_task, KeyValueStore, PurgeDeletesTaskConfig};

/// Strata key-value CLI
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(about = "Run a key-value operation script against an in-memory bucket", long_about = None)]
struct Cli {
    /// Path to bucket config TOML
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to operation script JSON
    #[arg(short, long)]
    script: PathBuf,

    /// Run purge-deletes in the background at this interval (milliseconds)
    #[arg(long)]
    purge_interval_ms: Option<u64>,
}

/// Wrapper for JSON output
#[derive(Debug, Serialize)]
struct CliOutput {
    bucket: String,
    steps: Vec<StepOutcome>,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ----------------------------
    // Load config
    // ----------------------------
    let config = CliConfig::load(cli.config.as_deref())
        .with_context(|| format!("loading config {:?}", cli.config))?;
    init_tracing(&config.log.level);

    // ----------------------------
    // Load script
    // ----------------------------
    let script_data = fs::read_to_string(&cli.script)
        .with_context(|| format!("reading script {}", cli.script.display()))?;
    let steps: Vec<Step> = serde_json::from_str(&script_data)?;

    // ----------------------------
    // Open bucket
    // ----------------------------
    let log = Arc::new(InMemoryLog::new(config.bucket.log_limits()));
    let kv = KeyValueStore::new(log, config.bucket)?;
    info!(bucket = kv.bucket(), steps = steps.len(), "running script");

    let purge_task = cli.purge_interval_ms.map(|ms| {
        spawn_purge_deletes_task(
            kv.clone(),
            PurgeDeletesTaskConfig {
                interval: Duration::from_millis(ms),
                threshold: None,
            },
        )
    });

    // ----------------------------
    // Run script
    // ----------------------------
    let outcomes = run_script(&kv, &steps).await;

    if let Some(cancel) = purge_task {
        cancel.cancel();
    }

    // ----------------------------
    // Output
    // ----------------------------
    let output = CliOutput {
        bucket: kv.bucket().to_string(),
        steps: outcomes,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
