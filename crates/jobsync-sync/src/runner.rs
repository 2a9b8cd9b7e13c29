use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use jobsync_adapters::{EnrichmentGateway, FetchError, JobSource};
use jobsync_core::{
    JobSummary, RunCounters, RunReport, RunStatus, ScrapeRequest, StopReason, Strategy,
};
use jobsync_storage::{JobStore, RunLedger};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_ERROR_THRESHOLD: u32 = 10;
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct RunState {
    counters: RunCounters,
    errors: Vec<String>,
    consecutive_failures: u32,
}

enum RecordStep {
    Continue,
    CaughtUp,
    Cancelled,
}

/// Drives one scrape run: opens the run row, pages through the source,
/// persists each record and finalises the run exactly once.
pub struct Runner {
    source: Arc<dyn JobSource>,
    jobs: Arc<dyn JobStore>,
    ledger: Arc<dyn RunLedger>,
    enrichment: Option<Arc<dyn EnrichmentGateway>>,
    error_threshold: u32,
    store_timeout: Duration,
}

impl Runner {
    pub fn new(
        source: Arc<dyn JobSource>,
        jobs: Arc<dyn JobStore>,
        ledger: Arc<dyn RunLedger>,
    ) -> Self {
        Self {
            source,
            jobs,
            ledger,
            enrichment: None,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_enrichment(mut self, gateway: Option<Arc<dyn EnrichmentGateway>>) -> Self {
        self.enrichment = gateway;
        self
    }

    pub fn with_error_threshold(mut self, threshold: u32) -> Self {
        self.error_threshold = threshold.max(1);
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Fails only when the request is invalid or the run row cannot be opened
    /// or closed; everything in between is folded into the report.
    pub async fn run(&self, request: &ScrapeRequest, cancel: &CancellationToken) -> Result<RunReport> {
        let mut request = request.clone();
        request.validate().context("invalid scrape request")?;

        let run_id = self
            .bounded(self.ledger.open_run(request.strategy, &request.to_json()))
            .await
            .context("opening run")?;

        let span = info_span!("scrape_run", %run_id, strategy = %request.strategy);
        let report = self
            .drive(run_id, &request, cancel)
            .instrument(span.clone())
            .await;

        if let Err(err) = self.bounded(self.ledger.close_run(&report)).await {
            error!(parent: &span, error = %err, "failed to finalise run");
            return Err(err.context(format!("closing run {run_id}")));
        }
        Ok(report)
    }

    async fn drive(&self, run_id: Uuid, request: &ScrapeRequest, cancel: &CancellationToken) -> RunReport {
        info!(
            max_pages = request.max_pages,
            start_page = request.start_page,
            polite = request.polite,
            keywords = %request.keywords,
            cantons = ?request.cantons,
            enrichment_enabled = self.enrichment.is_some(),
            "run started"
        );

        let mut state = RunState::default();
        let stop = self.page_loop(request, cancel, &mut state).await;
        let status = RunStatus::derive(stop, &state.counters, state.errors.len());
        let counters = state.counters;

        info!(
            %status,
            stop_reason = %stop,
            processed = counters.processed,
            inserted = counters.inserted,
            updated = counters.updated,
            skipped = counters.skipped,
            pages_scraped = counters.pages_scraped,
            ai_processed = counters.ai_processed,
            ai_skipped = counters.ai_skipped,
            ai_failed = counters.ai_failed,
            errors = state.errors.len(),
            "run finished"
        );

        RunReport {
            run_id,
            status,
            stop_reason: stop,
            counters,
            errors: state.errors,
        }
    }

    async fn page_loop(
        &self,
        request: &ScrapeRequest,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> StopReason {
        let last_page = (request.max_pages > 0)
            .then(|| request.start_page.saturating_add(request.max_pages));
        let mut page = request.start_page;

        loop {
            if cancel.is_cancelled() {
                return StopReason::Cancelled;
            }
            if last_page.is_some_and(|last| page >= last) {
                return StopReason::MaxPagesReached;
            }

            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StopReason::Cancelled,
                result = self.source.fetch_page(request, page) => result,
            };

            let summaries = match fetched {
                Ok(summaries) => summaries,
                Err(err) => {
                    if let Some(stop) = self.page_failed(page, err, state) {
                        return stop;
                    }
                    page = page.saturating_add(1);
                    continue;
                }
            };

            state.consecutive_failures = 0;
            state.counters.pages_scraped += 1;

            if summaries.is_empty() {
                info!(page, "no more jobs");
                return StopReason::EmptyPage;
            }
            info!(page, count = summaries.len(), "page fetched");

            for summary in &summaries {
                if cancel.is_cancelled() {
                    return StopReason::Cancelled;
                }
                match self.process_record(request, summary, cancel, state).await {
                    RecordStep::Continue => {}
                    RecordStep::CaughtUp => return StopReason::IncrementalCutoff,
                    RecordStep::Cancelled => return StopReason::Cancelled,
                }
            }
            page = page.saturating_add(1);
        }
    }

    /// Records a page failure and decides whether it ends the run.
    fn page_failed(&self, page: u32, err: FetchError, state: &mut RunState) -> Option<StopReason> {
        state.errors.push(format!("page {page}: {err}"));

        if err.is_rate_limit() {
            warn!(page, status = ?err.status(), "upstream result limit reached, stopping");
            return Some(StopReason::RateLimited);
        }

        state.consecutive_failures += 1;
        warn!(
            page,
            consecutive_failures = state.consecutive_failures,
            error = %err,
            "page fetch failed"
        );
        if state.consecutive_failures >= self.error_threshold {
            warn!(
                consecutive_failures = state.consecutive_failures,
                threshold = self.error_threshold,
                "too many consecutive errors, stopping"
            );
            return Some(StopReason::ErrorThreshold);
        }
        None
    }

    async fn process_record(
        &self,
        request: &ScrapeRequest,
        summary: &JobSummary,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> RecordStep {
        let job_id = summary.id.as_str();
        state.counters.processed += 1;

        let stored = match self.bounded(self.jobs.stored_updated_time(job_id)).await {
            Ok(stored) => stored,
            Err(err) => {
                error!(job_id, error = %err, "failed to check stored job");
                state.errors.push(format!("check {job_id}: {err}"));
                return RecordStep::Continue;
            }
        };

        if request.strategy == Strategy::Incremental {
            if let Some(stored_updated) = stored.as_deref() {
                if stored_updated == summary.updated_time {
                    info!(
                        job_id,
                        stored_updated,
                        api_updated = %summary.updated_time,
                        "incremental cutoff reached"
                    );
                    state.counters.skipped += 1;
                    return RecordStep::CaughtUp;
                }
            }
        }
        let existed = stored.is_some();

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return RecordStep::Cancelled,
            result = self.source.fetch_detail(job_id) => result,
        };
        let detail = match fetched {
            Ok(detail) => detail,
            Err(err) => {
                error!(job_id, error = %err, "failed to fetch job detail");
                state.errors.push(format!("job {job_id}: {err}"));
                return RecordStep::Continue;
            }
        };

        if let Err(err) = self.bounded(self.jobs.upsert_job(&detail)).await {
            error!(job_id, error = %err, "failed to store job");
            state.errors.push(format!("store {job_id}: {err}"));
            return RecordStep::Continue;
        }

        if existed {
            state.counters.updated += 1;
            debug!(job_id, "updated job");
        } else {
            state.counters.inserted += 1;
            debug!(job_id, "inserted job");
        }

        if let Some(gateway) = &self.enrichment {
            enrich(gateway.as_ref(), job_id, &mut state.counters).await;
        }
        RecordStep::Continue
    }

    async fn bounded<T, E>(&self, op: impl Future<Output = Result<T, E>>) -> Result<T>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match tokio::time::timeout(self.store_timeout, op).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(anyhow!(
                "store operation timed out after {}s",
                self.store_timeout.as_secs_f64()
            )),
        }
    }
}

async fn enrich(gateway: &dyn EnrichmentGateway, job_id: &str, counters: &mut RunCounters) {
    match gateway.enrich(job_id).await {
        Ok(outcome) if outcome.skipped => {
            counters.ai_skipped += 1;
            debug!(job_id, reason = ?outcome.skip_reason, "enrichment skipped");
        }
        Ok(outcome) => {
            counters.ai_processed += 1;
            debug!(job_id, saved_to_db = outcome.saved_to_db, "enrichment completed");
        }
        Err(err) => {
            counters.ai_failed += 1;
            warn!(job_id, error = %err, "enrichment failed");
        }
    }
}
