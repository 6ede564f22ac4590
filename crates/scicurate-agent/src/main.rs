//! scicurate: balanced scientific corpus curation.
//! Entry point for the `scicurate` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use scicurate_agent::run::StatusReport;
use scicurate_agent::{Config, DataLayout, Runner, Services};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "scicurate", version, about = "Harvest, score, select and enrich a balanced literature corpus")]
struct Cli {
    /// Path to scicurate.toml.
    #[arg(long, global = true, env = "SCICURATE_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `run.data_dir`.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Resume an interrupted run instead of starting a new one.
    #[arg(long, global = true)]
    run_id: Option<Uuid>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the corpus from scratch and freeze topic thresholds.
    Bootstrap,
    /// Add records published since the watermark.
    Monthly,
    /// Print the watermark, thresholds and last run.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("scicurate=debug,info")),
        )
        .init();

    let cli = Cli::parse();

    if let Command::Status = cli.command {
        let data_dir = cli.data_dir.unwrap_or_else(|| Config::data_dir_for(cli.config.as_deref()));
        let report = StatusReport::collect(&DataLayout::new(&data_dir)).await?;
        print!("{report}");
        return Ok(());
    }

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load config: {e}");
            return Err(e.into());
        }
    };
    if let Some(dir) = cli.data_dir {
        config.run.data_dir = dir;
    }

    let manifest = match cli.command {
        Command::Bootstrap => build_runner(config)?.bootstrap(cli.run_id).await?,
        Command::Monthly => build_runner(config)?.monthly(cli.run_id).await?,
        Command::Status => return Ok(()),
    };

    println!(
        "run {} {}: {} records in corpus ({} with full text, {} abstract-only), watermark {}",
        manifest.run_id,
        manifest.mode,
        manifest.counters.snapshot_records,
        manifest.fulltext.with_body,
        manifest.fulltext.abstract_only,
        manifest.watermark_after.map(|d| d.to_string()).unwrap_or_else(|| "unchanged".into()),
    );
    Ok(())
}

/// Validates the configuration and builds the live services.
fn build_runner(config: Config) -> anyhow::Result<Runner> {
    config.validate()?;
    info!(
        topics = config.topics.len(),
        target = config.selection.target,
        sources = ?config.fulltext.sources,
        data_dir = %config.run.data_dir.display(),
        "Configuration loaded"
    );
    let services = Services::from_config(&config)?;
    Ok(Runner::new(config, services))
}
