//! Climate product pipeline.
//!
//! Harmonizes the configured providers, computes decadal climatologies,
//! trends, anomalies and regional series, merges them into the
//! consolidated store and publishes it.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use clim_pipeline::{Pipeline, PipelineConfig};

#[derive(Parser, Debug)]
#[command(name = "clim-pipeline")]
#[command(about = "Climatology, trend and regional series products from heterogeneous providers")]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "CLIM_PIPELINE_CONFIG", default_value = "config/pipeline.yaml")]
    config: PathBuf,

    /// Log level (ignored when RUST_LOG is set)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Only process these canonical variables (repeatable)
    #[arg(long = "variable")]
    variables: Vec<String>,

    /// Only process these providers (repeatable)
    #[arg(long = "provider")]
    providers: Vec<String>,

    /// Merge into the local store but do not publish it
    #[arg(long)]
    skip_publish: bool,

    /// Manifest output path (default: <run dir>/manifest.json)
    #[arg(long)]
    manifest: Option<PathBuf>,
}

fn init_tracing(log_level: &str) -> Result<()> {
    let builder = FmtSubscriber::builder()
        .with_target(true)
        .with_thread_ids(true);

    if std::env::var("RUST_LOG").is_ok() {
        let subscriber = builder.with_env_filter(EnvFilter::from_default_env()).json().finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let level = match log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        let subscriber = builder.with_max_level(level).json().finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    info!(config = %args.config.display(), "Starting climate product pipeline");

    let mut config = PipelineConfig::load(&args.config)?;
    config.restrict(&args.providers, &args.variables)?;
    info!(
        providers = ?config.providers.iter().map(|p| p.name()).collect::<Vec<_>>(),
        variables = ?config.variables,
        "Loaded configuration"
    );

    let pipeline = Pipeline::from_config(config, args.skip_publish)?;
    let manifest = pipeline.run().await?;

    let manifest_path = args
        .manifest
        .unwrap_or_else(|| manifest.run_dir.join("manifest.json"));
    manifest
        .write(&manifest_path)
        .with_context(|| format!("Failed to write manifest to {:?}", manifest_path))?;
    info!(path = %manifest_path.display(), "Wrote run manifest");

    if manifest.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        error!(
            failed_units = manifest.failed_units.len(),
            "No unit succeeded"
        );
        Ok(ExitCode::FAILURE)
    }
}
