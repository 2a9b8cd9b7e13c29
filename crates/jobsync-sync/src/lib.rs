//! Run orchestration: configuration, the page/record runner and scheduled runs.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use jobsync_adapters::{AiServiceClient, EnrichmentGateway, JobRoomClient, JobSource};
use jobsync_core::{RunReport, ScrapeRequest, Strategy};
use jobsync_storage::{JobStore, PgStore, RunLedger};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;
mod runner;

pub use config::SyncConfig;
pub use runner::{Runner, DEFAULT_ERROR_THRESHOLD, DEFAULT_STORE_TIMEOUT};

pub const CRATE_NAME: &str = "jobsync-sync";

/// Connects to PostgreSQL and applies pending migrations.
pub async fn connect_store(config: &SyncConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.store_config())
        .await
        .context("connecting to database")?;
    store.migrate().await.context("applying migrations")?;
    Ok(Arc::new(store))
}

/// Builds the enrichment client when configured. An unreachable service is
/// logged and the run goes ahead without enrichment.
pub async fn connect_enrichment(config: &SyncConfig) -> Option<Arc<dyn EnrichmentGateway>> {
    let (url, mode) = config.enrichment_target()?;
    let client = match AiServiceClient::new(url, mode, config.ai_timeout()) {
        Ok(client) => client,
        Err(err) => {
            warn!(error = %err, "enrichment client unavailable");
            return None;
        }
    };
    match client.health_check().await {
        Ok(()) => {
            info!(url, %mode, "enrichment enabled");
            Some(Arc::new(client))
        }
        Err(err) => {
            warn!(url, error = %err, "enrichment service unhealthy, continuing without it");
            None
        }
    }
}

/// Everything a run needs besides the request. Runs through one pipeline
/// never overlap.
pub struct SyncPipeline {
    config: SyncConfig,
    jobs: Arc<dyn JobStore>,
    ledger: Arc<dyn RunLedger>,
    source: Option<Arc<dyn JobSource>>,
    enrichment: Option<Arc<dyn EnrichmentGateway>>,
    busy: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, jobs: Arc<dyn JobStore>, ledger: Arc<dyn RunLedger>) -> Self {
        Self {
            config,
            jobs,
            ledger,
            source: None,
            enrichment: None,
            busy: Mutex::new(()),
        }
    }

    /// Replaces the live job-room client, e.g. with a fixture replay.
    pub fn with_source(mut self, source: Arc<dyn JobSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_enrichment(mut self, gateway: Option<Arc<dyn EnrichmentGateway>>) -> Self {
        self.enrichment = gateway;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Fails `running` rows left behind by a process that died mid-run.
    pub async fn reap_abandoned_runs(&self) -> Result<u64> {
        let cutoff = Utc::now() - self.config.stale_run_age();
        let reaped = self
            .ledger
            .reap_abandoned_runs(cutoff)
            .await
            .context("reaping abandoned runs")?;
        if reaped > 0 {
            warn!(reaped, %cutoff, "marked abandoned runs as failed");
        }
        Ok(reaped)
    }

    pub async fn run_once(
        &self,
        request: &ScrapeRequest,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let _guard = self.busy.lock().await;
        self.execute(request, cancel).await
    }

    async fn execute(&self, request: &ScrapeRequest, cancel: &CancellationToken) -> Result<RunReport> {
        if let Err(err) = self.reap_abandoned_runs().await {
            warn!(error = %err, "could not reap abandoned runs");
        }

        let source: Arc<dyn JobSource> = match &self.source {
            Some(source) => source.clone(),
            None => Arc::new(
                JobRoomClient::new(self.config.job_room_config(request.polite))
                    .context("building job-room client")?,
            ),
        };

        Runner::new(source, self.jobs.clone(), self.ledger.clone())
            .with_enrichment(self.enrichment.clone())
            .with_error_threshold(self.config.max_consecutive_errors)
            .with_store_timeout(self.config.database_timeout())
            .run(request, cancel)
            .await
    }

    /// One scheduler tick: an incremental run with configured defaults,
    /// skipped when the previous run is still going.
    pub async fn run_scheduled(&self, cancel: &CancellationToken) -> Option<RunReport> {
        let Ok(_guard) = self.busy.try_lock() else {
            warn!("previous run still in progress, skipping scheduled run");
            return None;
        };
        if cancel.is_cancelled() {
            return None;
        }
        let request = self.config.default_request(Strategy::Incremental);
        match self.execute(&request, cancel).await {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "scheduled run failed");
                None
            }
        }
    }

    /// Resolves once no run holds the pipeline. After cancelling, this is
    /// the point where an in-flight run has closed its run row.
    pub async fn wait_idle(&self) {
        let _guard = self.busy.lock().await;
    }

    pub async fn build_scheduler(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.scheduler_cron.clone();
        let pipeline = self.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let pipeline = pipeline.clone();
            let cancel = cancel.clone();
            Box::pin(async move {
                if cancel.is_cancelled() {
                    return;
                }
                pipeline.run_scheduled(&cancel).await;
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }
}
