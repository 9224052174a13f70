//! Harvester CLI - copies newly created screenshots out of a source tree.

use clap::Parser;
use screenshot_harvester::{shutdown_on, HarvestLoop, Harvester, JsonFileStore, Settings};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "harvester")]
#[command(version)]
#[command(about = "Copies newly created images from a source tree into a flat directory", long_about = None)]
struct Cli {
    /// JSON settings file; command-line flags override its values
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Directory tree to scan
    #[arg(short, long)]
    source: Option<PathBuf>,

    /// Directory receiving copies
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Seconds between passes
    #[arg(short, long)]
    interval: Option<u64>,

    /// Regex matched against file names
    #[arg(short, long)]
    pattern: Option<String>,

    /// Where the watermark is persisted
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Failing passes tolerated before the watermark moves past a failure
    #[arg(long)]
    retry_limit: Option<u32>,

    /// Run a single pass and exit
    #[arg(long)]
    once: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn overrides(&self) -> Settings {
        Settings {
            source_dir: self.source.clone(),
            output_dir: self.output.clone(),
            interval_secs: self.interval,
            file_pattern: self.pattern.clone(),
            state_file: self.state_file.clone(),
            retry_limit: self.retry_limit,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let base = match &cli.settings {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };
    let config = base.merge(cli.overrides()).build()?;

    info!(
        source = %config.source_dir.display(),
        output = %config.output_dir.display(),
        interval_secs = config.interval.as_secs(),
        pattern = %config.file_filter,
        "Starting harvester"
    );

    let store = JsonFileStore::new(&config.state_file);
    let harvester = Harvester::initialize(config, store).await?;
    let mut harvest_loop = HarvestLoop::new(harvester);

    if cli.once {
        let result = harvest_loop.run_once().await?;
        info!(copied = result.copied, "Single pass finished");
        return Ok(());
    }

    harvest_loop
        .run_until(shutdown_on(tokio::signal::ctrl_c()))
        .await;
    Ok(())
}
