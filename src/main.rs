mod config;
mod csv_writer;
mod dom;
mod error;
mod excel_writer;
mod exporter;
mod extractors;
mod models;
mod normalizer;
mod pipeline;
mod session;
mod sheets;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::exporter::{Exporter, RetryPolicy};
use crate::models::{Environment, Section};
use crate::pipeline::RunSummary;
use crate::session::ChromeBrowser;
use crate::sheets::{GoogleSheetsClient, SheetsClient};

/// Snapshot OA.Report dashboard metrics into CSV and a shared spreadsheet.
#[derive(Debug, Parser)]
#[command(name = "oareport-scraper", version)]
struct Args {
    /// Deployment to scrape
    #[arg(long, value_enum)]
    env: Environment,

    /// Dashboard section to scrape
    #[arg(long, value_enum)]
    section: Section,

    #[arg(long, default_value = "config/settings.yaml")]
    config: PathBuf,

    /// Show the browser window
    #[arg(long)]
    headed: bool,

    /// Skip the remote spreadsheet and only write the local artifact
    #[arg(long)]
    local_only: bool,

    /// Also save every record of this run to an .xlsx workbook
    #[arg(long)]
    xlsx: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("Starting OA.Report scraper for {}/{}", args.env, args.section);

    match run(&args).await {
        Ok(summary) if summary.is_success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(args: &Args) -> Result<RunSummary> {
    let config = Config::load(&args.config)?;

    let remote: Option<Box<dyn SheetsClient>> = if args.local_only {
        info!("Local-only run, remote spreadsheet skipped");
        None
    } else {
        let client = GoogleSheetsClient::from_credentials(config.export.credentials.as_deref())
            .context("setting up spreadsheet client (use --local-only to skip)")?;
        Some(Box::new(client))
    };

    let mut exporter = Exporter::new(
        config.export.output_dir.clone(),
        remote,
        RetryPolicy::new(config.export.retry_delay()),
    );
    if let Some(path) = &args.xlsx {
        exporter = exporter.with_workbook(path.clone())?;
    }

    let headless = !args.headed;
    if !headless {
        info!("Running in headed mode (browser visible)");
    }
    let browser = ChromeBrowser::launch(headless, config.delays.clone()).await?;

    let summary = pipeline::run(&config, args.env, args.section, &browser, &mut exporter).await;

    if let Err(e) = browser.close().await {
        warn!("Failed to close browser: {}", e);
    }
    let summary = summary?;
    exporter.finish()?;

    for failed in summary.failures() {
        warn!("Not exported: {} ({}): {:?}", failed.organisation, failed.url, failed.status);
    }
    info!(
        "Run complete for {}/{}! {} of {} organisations exported, {} records. Local data in {}",
        summary.environment,
        summary.section,
        summary.outcomes.len() - summary.failures().count(),
        summary.outcomes.len(),
        summary.exported_records(),
        config.export.output_dir.display()
    );

    Ok(summary)
}
