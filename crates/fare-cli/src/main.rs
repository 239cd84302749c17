use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use fare_core::ReportToken;
use fare_reports::{download_backfill, FareReportFetcher};
use fare_sync::{bootstrap, build_repository, build_scheduler, SyncConfig, UpdatePipeline};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "fare-cli")]
#[command(about = "Weekly fare swipe ingestion and publishing")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one update cycle against the durable table.
    Update,
    /// Build the durable table from a directory of backfill files.
    Bootstrap {
        /// Defaults to `$FARE_DATA_DIR/backfill`.
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Download consecutive weekly reports as backfill files.
    Backfill {
        /// Posting token (YYMMDD) of the first report.
        #[arg(long)]
        begin: String,
        #[arg(long, default_value_t = 52)]
        weeks: usize,
        /// Defaults to `$FARE_DATA_DIR/backfill`.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print where the next report is expected.
    Next,
    /// Run update cycles on the configured cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder().with_env_filter(env).init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let command = cli.command.unwrap_or(if config.scheduler_enabled {
        Commands::Schedule
    } else {
        Commands::Update
    });

    match command {
        Commands::Update => {
            let report = fare_sync::run_once_from_env().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Bootstrap { dir } => {
            let http = config.http_fetcher()?;
            let repository = build_repository(&config, &http)?;
            let dir = dir.unwrap_or_else(|| config.backfill_dir());
            let status = bootstrap(repository.as_ref(), &dir, Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Backfill { begin, weeks, out } => {
            let first = ReportToken::from_stamp(&begin)
                .with_context(|| format!("--begin {begin:?} is not a YYMMDD date"))?;
            let out = out.unwrap_or_else(|| config.backfill_dir());
            let fetcher = FareReportFetcher::new(config.http_fetcher()?);
            let summary =
                download_backfill(&fetcher, &config.report_base_url, first, weeks, &out).await?;
            println!(
                "backfill complete: written={} failed={}",
                summary.written.len(),
                summary.failed.len()
            );
            for address in &summary.failed {
                println!("  unavailable: {address}");
            }
        }
        Commands::Next => {
            let location = UpdatePipeline::from_config(&config)?.next_location().await?;
            println!(
                "week={} token={} address={}",
                location.effective_week, location.token, location.address
            );
        }
        Commands::Schedule => {
            let pipeline = Arc::new(UpdatePipeline::from_config(&config)?);
            let mut sched = build_scheduler(pipeline, &config.sync_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down");
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
