use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use jobsync_adapters::FixtureSource;
use jobsync_core::{RunStatus, ScrapeRequest, Strategy};
use jobsync_storage::{JobStore, MemoryStore, RunLedger};
use jobsync_sync::{connect_enrichment, connect_store, SyncConfig, SyncPipeline};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jobsync")]
#[command(about = "Job-room ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scrape now.
    Scrape(ScrapeArgs),
    /// Apply database migrations.
    Migrate,
    /// Show recent runs, newest first.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Run incremental scrapes on SCHEDULER_CRON until interrupted.
    Schedule,
}

#[derive(Debug, Args)]
struct ScrapeArgs {
    /// `full` or `incremental`.
    #[arg(long, default_value = "full")]
    strategy: Strategy,
    /// Pages to fetch; 0 is unlimited. Defaults to SCRAPER_DEFAULT_MAX_PAGES.
    #[arg(long)]
    max_pages: Option<u32>,
    #[arg(long, default_value_t = 0)]
    start_page: u32,
    #[arg(long, default_value = "")]
    keywords: String,
    /// Canton codes, repeatable or comma separated.
    #[arg(long = "canton", value_delimiter = ',')]
    cantons: Vec<String>,
    #[arg(long, default_value_t = 10)]
    workload_min: u32,
    #[arg(long, default_value_t = 100)]
    workload_max: u32,
    #[arg(long)]
    permanent: Option<bool>,
    /// Publication window in days. Defaults to SCRAPER_DEFAULT_DAYS_BACK.
    #[arg(long)]
    days_back: Option<u32>,
    /// Skip the randomized delay between requests.
    #[arg(long)]
    no_polite: bool,
    /// Replay a fixture bundle instead of calling job-room.
    #[arg(long)]
    fixture: Option<PathBuf>,
    /// Keep everything in memory; nothing touches the database.
    #[arg(long)]
    dry_run: bool,
}

impl ScrapeArgs {
    fn to_request(&self, config: &SyncConfig) -> ScrapeRequest {
        ScrapeRequest {
            strategy: self.strategy,
            max_pages: self.max_pages.unwrap_or(config.default_max_pages),
            start_page: self.start_page,
            keywords: self.keywords.clone(),
            cantons: self.cantons.clone(),
            workload_min: self.workload_min,
            workload_max: self.workload_max,
            permanent: self.permanent,
            days_back: self.days_back.unwrap_or(config.default_days_back),
            polite: !self.no_polite,
        }
    }
}

fn init_tracing() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer().compact()))
        .init();
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            child.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Scrape(args) => scrape(config, args).await?,
        Commands::Migrate => {
            connect_store(&config).await?;
            println!("migrations applied");
        }
        Commands::Runs { limit } => {
            let store = connect_store(&config).await?;
            for run in store.list_runs(limit).await.context("listing runs")? {
                let c = run.counters;
                println!(
                    "{} {} {:<11} {:<10} pages={} processed={} inserted={} updated={} skipped={} ai={}/{}/{} stop={}",
                    run.id,
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.strategy.as_str(),
                    run.status.as_str(),
                    c.pages_scraped,
                    c.processed,
                    c.inserted,
                    c.updated,
                    c.skipped,
                    c.ai_processed,
                    c.ai_skipped,
                    c.ai_failed,
                    run.stop_reason.as_deref().unwrap_or("-"),
                );
            }
        }
        Commands::Schedule => schedule(config).await?,
    }

    Ok(())
}

async fn scrape(config: SyncConfig, args: ScrapeArgs) -> Result<()> {
    let request = args.to_request(&config);
    let enrichment = connect_enrichment(&config).await;

    let jobs: Arc<dyn JobStore>;
    let ledger: Arc<dyn RunLedger>;
    if args.dry_run {
        let store = Arc::new(MemoryStore::new());
        jobs = store.clone();
        ledger = store;
    } else {
        let store = connect_store(&config).await?;
        jobs = store.clone();
        ledger = store;
    }

    let mut pipeline = SyncPipeline::new(config, jobs.clone(), ledger).with_enrichment(enrichment);
    if let Some(path) = &args.fixture {
        let source = FixtureSource::from_path(path)
            .with_context(|| format!("loading fixture {}", path.display()))?;
        pipeline = pipeline.with_source(Arc::new(source));
    }

    let cancel = cancel_on_ctrl_c();
    let report = pipeline.run_once(&request, &cancel).await?;
    let stored = jobs.count_jobs().await.context("counting stored jobs")?;
    let c = report.counters;
    println!(
        "run {} {} ({}): pages={} processed={} inserted={} updated={} skipped={} errors={} stored_jobs={}",
        report.run_id,
        report.status,
        report.stop_reason,
        c.pages_scraped,
        c.processed,
        c.inserted,
        c.updated,
        c.skipped,
        report.errors.len(),
        stored,
    );

    if report.status == RunStatus::Failed {
        bail!("run {} failed: {}", report.run_id, report.stop_reason);
    }
    Ok(())
}

async fn schedule(config: SyncConfig) -> Result<()> {
    let store = connect_store(&config).await?;
    let enrichment = connect_enrichment(&config).await;
    let cron = config.scheduler_cron.clone();
    let pipeline = Arc::new(
        SyncPipeline::new(config, store.clone(), store).with_enrichment(enrichment),
    );
    pipeline.reap_abandoned_runs().await?;

    let cancel = CancellationToken::new();
    let mut sched = pipeline.clone().build_scheduler(cancel.clone()).await?;
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler started");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    warn!("interrupt received, stopping scheduler");
    cancel.cancel();
    pipeline.wait_idle().await;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
