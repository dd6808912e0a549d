//! `picopt` command-line entry point.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use picopt::config::{LoggingConfig, OptimizationConfig};
use picopt::history::HistoryView;
use picopt::storage::{read_journal, HistoryHeader};
use picopt::template::{Renderer, Template};

/// Resumable multi-fidelity optimization of simulation parameters.
#[derive(Debug, Parser)]
#[command(name = "picopt", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run (or resume) the optimization in a directory.
    Run {
        /// Optimization directory containing `optimization.yaml`.
        #[arg(default_value = ".", env = "PICOPT_DIR")]
        dir: PathBuf,
    },
    /// Validate the configuration and template without running anything.
    Check {
        /// Optimization directory containing `optimization.yaml`.
        #[arg(default_value = ".", env = "PICOPT_DIR")]
        dir: PathBuf,
    },
    /// Summarize the history of an optimization directory.
    History {
        /// Optimization directory containing `optimization.yaml`.
        #[arg(default_value = ".", env = "PICOPT_DIR")]
        dir: PathBuf,
        /// Write every trial as CSV to this file.
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Write every trial record as JSON to this file.
        #[arg(long)]
        json: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run { dir } => run(&dir).await,
        Commands::Check { dir } => check(&dir),
        Commands::History { dir, csv, json } => history(&dir, csv.as_deref(), json.as_deref()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn load(dir: &Path) -> Result<OptimizationConfig> {
    OptimizationConfig::load(dir)
        .with_context(|| format!("failed to load configuration from {}", dir.display()))
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(dir: &Path) -> Result<()> {
    let config = load(dir)?;
    init_logging(&config.logging);

    let mut driver = config
        .into_builder(dir)
        .context("failed to prepare the driver")?
        .build()
        .context("failed to start the driver")?;

    let stop = driver.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, draining in-flight trials");
            stop.stop();
        }
    });

    let summary = driver.run().await.context("optimization aborted")?;
    println!("{summary}");
    Ok(())
}

fn check(dir: &Path) -> Result<()> {
    let config = load(dir)?;
    let template_path = dir.join(&config.template);
    let template = Template::from_file(&template_path)
        .with_context(|| format!("failed to read template {}", template_path.display()))?;
    config
        .space
        .check_template(template.placeholders())
        .context("template does not match the search space")?;

    let path = dir.join(&config.history);
    let trials = if path.exists() {
        let (header, snapshot) = read_journal(&path)
            .with_context(|| format!("failed to read history {}", path.display()))?;
        header
            .check_compatible(&HistoryHeader::new(config.direction, config.space.clone()), &path)
            .context("history cannot be resumed with this configuration")?;
        snapshot.len()
    } else {
        0
    };

    println!(
        "ok: {} variables, template {}, history {} ({trials} trials)",
        config.space.variables().len(),
        template_path.display(),
        path.display(),
    );
    Ok(())
}

fn history(dir: &Path, csv: Option<&Path>, json: Option<&Path>) -> Result<()> {
    let config = load(dir)?;
    let path = dir.join(&config.history);
    let view = HistoryView::from_journal(&path)
        .with_context(|| format!("failed to read history {}", path.display()))?;

    println!("{view}");
    if let Some(csv) = csv {
        view.export_csv(csv)
            .with_context(|| format!("failed to write {}", csv.display()))?;
    }
    if let Some(json) = json {
        view.export_json(json)
            .with_context(|| format!("failed to write {}", json.display()))?;
    }
    Ok(())
}
