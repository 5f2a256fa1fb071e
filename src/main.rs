use clap::{Parser, Subcommand};
use colored::Colorize;
use pincali_core::{
    db::AtomicClaim, Clock, Database, Result, SyncConfig, SystemClock,
};
use pincali_engine::{
    CancelToken, DiffDetector, HttpDetailScraper, HttpPageFetcher, ManifestScanner, QueueWorker,
    Scheduler, TierOrchestrator, TierResult,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long, default_value = "pincali.toml")]
    config: PathBuf,

    /// Database file path
    #[arg(short = 'd', long, default_value = "pincali.db")]
    database: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the schedule status for all tiers
    Status,

    /// Run a specific tier (1-4) with full queue processing
    RunTier {
        /// Tier level to run
        tier: i64,

        /// Wait for any running tier to finish instead of failing fast
        #[arg(long)]
        force: bool,
    },

    /// Run every tier that is due according to its schedule
    RunScheduled,

    /// Show scrape queue statistics
    QueueStats,

    /// Drain the scrape queue without running a tier
    ProcessQueue {
        /// Maximum number of items to process
        #[arg(long, default_value_t = 100)]
        batch_size: usize,

        /// Seconds to wait between detail scrapes
        #[arg(long, default_value_t = 1.0)]
        rate_limit: f64,
    },

    /// Show recent sync run history
    History {
        /// Restrict to one tier
        #[arg(long)]
        tier: Option<i64>,

        /// Maximum runs to show
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },

    /// Summarize sync activity over a period
    Summary {
        /// Days to look back
        #[arg(long, default_value_t = 7)]
        days: i64,
    },

    /// Run the scheduler continuously
    Daemon {
        /// Seconds between schedule checks
        #[arg(long, default_value_t = 300)]
        interval: u64,
    },
}

struct Engine {
    scheduler: Scheduler,
    db: Arc<Database>,
    config: Arc<SyncConfig>,
}

async fn build_engine(cli: &Cli) -> Result<Engine> {
    let config = Arc::new(SyncConfig::load(&cli.config)?);
    let db = Arc::new(Database::open(&cli.database).await?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let fetcher = Arc::new(HttpPageFetcher::new(&config)?);
    let scraper = Arc::new(HttpDetailScraper::new(&config)?);

    let scanner = ManifestScanner::new(
        Arc::clone(&db),
        fetcher.clone(),
        Arc::clone(&config),
        Arc::clone(&clock),
    )?;
    let diff = DiffDetector::new(Arc::clone(&db), fetcher, Arc::clone(&clock));
    let worker = QueueWorker::new(
        Arc::clone(&db),
        scraper,
        Arc::new(AtomicClaim),
        Arc::clone(&config),
        Arc::clone(&clock),
        format!("worker-{}", std::process::id()),
    );
    let orchestrator = Arc::new(TierOrchestrator::new(
        Arc::clone(&db),
        scanner,
        diff,
        worker,
        Arc::clone(&config),
        Arc::clone(&clock),
    ));
    let scheduler = Scheduler::new(
        Arc::clone(&db),
        orchestrator,
        Arc::clone(&config),
        clock,
    );

    Ok(Engine {
        scheduler,
        db,
        config,
    })
}

fn print_tier_result(result: &TierResult) {
    let status = if result.success {
        "success".green().bold()
    } else {
        "failed".red().bold()
    };
    println!(
        "Tier {} ({}): {} in {:.1}s",
        result.tier_level,
        result.tier_name,
        status,
        result.duration_ms as f64 / 1000.0
    );
    println!(
        "  pages: {}  new: {}  price changes: {}  removals: {}  relisted: {}",
        result.pages_scanned,
        result.new_properties,
        result.price_changes,
        result.removals_confirmed,
        result.relisted_count
    );
    println!(
        "  queued: {}  scraped: {}",
        result.properties_queued, result.properties_scraped
    );
    if !result.errors.is_empty() {
        println!("  errors ({}):", result.errors.len());
        for error in result.errors.iter().take(5) {
            println!("    - {}", error);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let engine = build_engine(&cli).await?;

    match cli.command {
        Commands::Status => {
            let status = engine.scheduler.status().await?;
            println!("{}", "TIER SYNC SCHEDULE STATUS".bold());
            println!(
                "Last updated: {}",
                status.last_updated.format("%Y-%m-%d %H:%M:%S UTC")
            );
            if let Some(running) = status.current_running_tier {
                println!("Currently running: Tier {}", running);
            }
            println!();

            for tier in &status.tiers {
                let last_run = tier
                    .last_run_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                let next_run = tier
                    .next_run_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "now".to_string());
                let state = if tier.is_running {
                    "running".cyan()
                } else if tier.is_due {
                    "due".yellow()
                } else if tier.last_run_success {
                    "ok".green()
                } else if tier.last_run_at.is_some() {
                    "failed".red()
                } else {
                    "pending".normal()
                };
                println!(
                    "T{} {:<16} last: {:<17} next: {:<17} [{}]",
                    tier.tier_level, tier.tier_name, last_run, next_run, state
                );
            }

            println!();
            for tier in &engine.config.tiers {
                println!(
                    "T{} ({}): every {}h, {} pages",
                    tier.level,
                    tier.name,
                    tier.frequency_hours,
                    if tier.pages_to_scan == 0 {
                        "all".to_string()
                    } else {
                        tier.pages_to_scan.to_string()
                    }
                );
            }
        }

        Commands::RunTier { tier, force } => {
            info!("Running tier {} (force: {})", tier, force);
            let result = engine.scheduler.run_single(tier, force).await?;
            print_tier_result(&result);
            if !result.success {
                std::process::exit(1);
            }
        }

        Commands::RunScheduled => {
            let results = engine.scheduler.run_scheduled().await;
            if results.is_empty() {
                println!("No tiers due.");
            }
            for result in &results {
                print_tier_result(result);
            }
        }

        Commands::QueueStats => {
            let stats = engine.db.queue_stats().await?;
            println!("{}", "SCRAPE QUEUE".bold());
            println!("  pending:     {}", stats.pending);
            println!("  in progress: {}", stats.in_progress);
            println!("  completed:   {}", stats.completed);
            println!("  failed:      {}", stats.failed);
            println!("  cancelled:   {}", stats.cancelled);
            if !stats.by_priority.is_empty() {
                println!("  pending by priority:");
                for (priority, count) in &stats.by_priority {
                    println!("    {}: {}", priority, count);
                }
            }
            if !stats.by_reason.is_empty() {
                println!("  pending by reason:");
                for (reason, count) in &stats.by_reason {
                    println!("    {}: {}", reason, count);
                }
            }
        }

        Commands::ProcessQueue {
            batch_size,
            rate_limit,
        } => {
            let scraper = Arc::new(HttpDetailScraper::new(&engine.config)?);
            let worker = QueueWorker::new(
                Arc::clone(&engine.db),
                scraper,
                Arc::new(AtomicClaim),
                Arc::clone(&engine.config),
                Arc::new(SystemClock),
                format!("worker-{}", std::process::id()),
            );
            let result = worker
                .drain(
                    batch_size,
                    Duration::from_secs_f64(rate_limit),
                    &CancelToken::new(),
                )
                .await?;
            println!(
                "Processed {} items: {} succeeded, {} failed in {:.1}s",
                result.processed,
                result.succeeded,
                result.failed,
                result.duration_ms as f64 / 1000.0
            );
        }

        Commands::History { tier, limit } => {
            let runs = engine.scheduler.history(tier, limit).await?;
            if runs.is_empty() {
                println!("No sync runs recorded.");
            }
            for run in &runs {
                println!(
                    "{} T{} {:<14} {:<9} pages: {:<4} new: {:<4} prices: {:<4} removals: {:<3} scraped: {}",
                    run.started_at.format("%Y-%m-%d %H:%M"),
                    run.tier_level,
                    run.tier_name,
                    run.status.as_str(),
                    run.pages_scanned,
                    run.new_properties_found,
                    run.price_changes_detected,
                    run.removals_confirmed,
                    run.properties_scraped
                );
                if let Some(summary) = &run.error_summary {
                    println!("    errors: {}", summary);
                }
            }
        }

        Commands::Summary { days } => {
            let summary = engine.scheduler.summary(days).await?;
            println!("{} (last {} days)", "SYNC SUMMARY".bold(), summary.period_days);
            println!(
                "  runs: {} ({} ok, {} failed)",
                summary.total_runs, summary.successful_runs, summary.failed_runs
            );
            println!("  new properties: {}", summary.total_new_properties);
            println!("  price changes:  {}", summary.total_price_changes);
            println!("  removals:       {}", summary.total_removals);
            println!("  scraped:        {}", summary.total_scraped);
            println!(
                "  avg duration:   {:.1}s",
                summary.average_duration_ms as f64 / 1000.0
            );
            for tier in &summary.by_tier {
                println!(
                    "  T{} {:<14} runs: {:<3} ok: {:<3} new: {:<4} prices: {}",
                    tier.tier_level,
                    tier.tier_name,
                    tier.runs,
                    tier.successful,
                    tier.new_properties,
                    tier.price_changes
                );
            }
        }

        Commands::Daemon { interval } => {
            let cancel = CancelToken::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown signal received");
                    signal_cancel.cancel();
                }
            });

            engine
                .scheduler
                .run_continuous(Duration::from_secs(interval), None, &cancel)
                .await;
        }
    }

    Ok(())
}
