use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobsync_core::{
    Company, CompanyKey, JobDetail, Location, LocationKey, RunCounters, RunRecord, RunReport,
    RunStatus, Strategy,
};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    ChildRows, DescriptionRow, JobStore, RunLedger, StoreError, UpsertOutcome, UpsertReceipt,
    ABANDONED_RUN_NOTE,
};

/// Job row as kept by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredJob {
    pub id: String,
    pub created_time: String,
    pub updated_time: String,
    pub status: String,
    pub fingerprint: Option<String>,
    pub company_id: i64,
    pub location_id: i64,
    pub raw_data: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChildCounts {
    pub employments: usize,
    pub publications: usize,
    pub apply_channels: usize,
    pub descriptions: usize,
    pub occupations: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    last_company_id: i64,
    last_location_id: i64,
    companies: BTreeMap<CompanyKey, (i64, Company)>,
    locations: BTreeMap<LocationKey, (i64, Location)>,
    jobs: BTreeMap<String, StoredJob>,
    children: BTreeMap<String, ChildRows>,
    runs: BTreeMap<Uuid, RunRecord>,
}

/// Reference-row id counters at the start of an upsert.
#[derive(Debug, Clone, Copy)]
struct Savepoint {
    last_company_id: i64,
    last_location_id: i64,
}

impl MemoryState {
    fn company_id(&mut self, company: &Company) -> i64 {
        let key = company.natural_key();
        if let Some((id, _)) = self.companies.get(&key) {
            return *id;
        }
        self.last_company_id += 1;
        let id = self.last_company_id;
        self.companies.insert(key, (id, company.clone()));
        id
    }

    fn location_id(&mut self, location: &Location) -> i64 {
        let key = location.natural_key();
        if let Some((id, _)) = self.locations.get(&key) {
            return *id;
        }
        self.last_location_id += 1;
        let id = self.last_location_id;
        self.locations.insert(key, (id, location.clone()));
        id
    }

    fn savepoint(&self) -> Savepoint {
        Savepoint {
            last_company_id: self.last_company_id,
            last_location_id: self.last_location_id,
        }
    }

    /// Drops reference rows created after `mark`. Ids only grow, so those
    /// are exactly the rows with a larger id.
    fn rollback_to(&mut self, mark: Savepoint) {
        self.companies.retain(|_, (id, _)| *id <= mark.last_company_id);
        self.locations.retain(|_, (id, _)| *id <= mark.last_location_id);
        self.last_company_id = mark.last_company_id;
        self.last_location_id = mark.last_location_id;
    }

    /// Same step order as the SQL transaction. Job and child rows are only
    /// written once every check has passed; reference rows created before a
    /// failure are undone by the caller.
    fn upsert(&mut self, job: &JobDetail) -> Result<UpsertReceipt, StoreError> {
        let company_id = self.company_id(&job.job_content.company);
        let location_id = self.location_id(&job.job_content.location);

        if job.id.is_empty() {
            return Err(StoreError::Constraint("jobs_id_not_empty".to_string()));
        }

        let row = StoredJob {
            id: job.id.clone(),
            created_time: job.created_time.clone(),
            updated_time: job.updated_time.clone(),
            status: job.status.clone(),
            fingerprint: job.fingerprint.clone(),
            company_id,
            location_id,
            raw_data: job.snapshot(),
        };
        let outcome = match self.jobs.insert(job.id.clone(), row) {
            Some(previous) => {
                // created_time is never rewritten, matching the SQL upsert
                if let Some(current) = self.jobs.get_mut(&job.id) {
                    current.created_time = previous.created_time;
                }
                UpsertOutcome::Updated
            }
            None => UpsertOutcome::Inserted,
        };

        self.children.insert(job.id.clone(), ChildRows::from_job(job));

        Ok(UpsertReceipt {
            company_id,
            location_id,
            outcome,
        })
    }
}

/// In-process store with the same semantics as the PostgreSQL one.
///
/// An upsert that fails leaves no rows behind, like a rolled back database
/// transaction. Used by tests and `--dry-run`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn job(&self, id: &str) -> Option<StoredJob> {
        self.state.lock().await.jobs.get(id).cloned()
    }

    pub async fn company_count(&self) -> usize {
        self.state.lock().await.companies.len()
    }

    pub async fn location_count(&self) -> usize {
        self.state.lock().await.locations.len()
    }

    pub async fn descriptions(&self, job_id: &str) -> Vec<DescriptionRow> {
        self.state
            .lock()
            .await
            .children
            .get(job_id)
            .map(|rows| rows.descriptions.clone())
            .unwrap_or_default()
    }

    pub async fn child_counts(&self, job_id: &str) -> ChildCounts {
        match self.state.lock().await.children.get(job_id) {
            Some(rows) => ChildCounts {
                employments: 1,
                publications: 1,
                apply_channels: 1,
                descriptions: rows.descriptions.len(),
                occupations: rows.occupations.len(),
            },
            None => ChildCounts::default(),
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn upsert_job(&self, job: &JobDetail) -> Result<UpsertReceipt, StoreError> {
        let mut state = self.state.lock().await;
        let mark = state.savepoint();
        match state.upsert(job) {
            Ok(receipt) => Ok(receipt),
            Err(err) => {
                state.rollback_to(mark);
                Err(err)
            }
        }
    }

    async fn stored_updated_time(&self, id: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .jobs
            .get(id)
            .map(|job| job.updated_time.clone()))
    }

    async fn count_jobs(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.jobs.len() as u64)
    }
}

#[async_trait]
impl RunLedger for MemoryStore {
    async fn open_run(&self, strategy: Strategy, filters: &JsonValue) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let record = RunRecord {
            id,
            strategy,
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            stop_reason: None,
            counters: RunCounters::default(),
            filters: filters.clone(),
            error_log: None,
        };
        self.state.lock().await.runs.insert(id, record);
        Ok(id)
    }

    async fn close_run(&self, report: &RunReport) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .get_mut(&report.run_id)
            .ok_or(StoreError::RunNotFound(report.run_id))?;
        if run.status.is_terminal() {
            return Err(StoreError::RunAlreadyClosed(report.run_id));
        }
        run.status = report.status;
        run.stop_reason = Some(report.stop_reason.as_str().to_string());
        run.counters = report.counters;
        run.error_log = report.error_log();
        run.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<RunRecord, StoreError> {
        self.state
            .lock()
            .await
            .runs
            .get(&id)
            .cloned()
            .ok_or(StoreError::RunNotFound(id))
    }

    async fn list_runs(&self, limit: u32) -> Result<Vec<RunRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut runs: Vec<RunRecord> = state.runs.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn reap_abandoned_runs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut reaped = 0;
        for run in state.runs.values_mut() {
            if run.status == RunStatus::Running && run.started_at < cutoff {
                run.status = RunStatus::Failed;
                run.finished_at = Some(Utc::now());
                run.error_log = Some(match run.error_log.take() {
                    Some(log) if !log.is_empty() => format!("{log}\n{ABANDONED_RUN_NOTE}"),
                    _ => ABANDONED_RUN_NOTE.to_string(),
                });
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobsync_core::{JobDescription, StopReason};

    fn job(id: &str, employer: &str, languages: &[&str]) -> JobDetail {
        let mut job = JobDetail {
            id: id.to_string(),
            created_time: "2026-01-01T08:00:00Z".into(),
            updated_time: "2026-01-02T08:00:00Z".into(),
            status: "PUBLISHED_PUBLIC".into(),
            ..JobDetail::default()
        };
        job.job_content.company = Company {
            name: employer.to_string(),
            postal_code: "8001".into(),
            city: "Zürich".into(),
            ..Company::default()
        };
        job.job_content.location = Location {
            postal_code: "8001".into(),
            city: "Zürich".into(),
            canton_code: "ZH".into(),
            ..Location::default()
        };
        job.job_content.job_descriptions = languages
            .iter()
            .map(|lang| JobDescription {
                language_iso_code: lang.to_string(),
                title: format!("title-{lang}"),
                description: format!("body-{lang}"),
            })
            .collect();
        job
    }

    #[tokio::test]
    async fn upserting_twice_is_idempotent() {
        let store = MemoryStore::new();
        let payload = job("a1", "Acme AG", &["de", "fr", "en"]);

        let first = store.upsert_job(&payload).await.unwrap();
        let second = store.upsert_job(&payload).await.unwrap();

        assert_eq!(first.outcome, UpsertOutcome::Inserted);
        assert_eq!(second.outcome, UpsertOutcome::Updated);
        assert_eq!(first.company_id, second.company_id);
        assert_eq!(first.location_id, second.location_id);
        assert_eq!(store.count_jobs().await.unwrap(), 1);
        assert_eq!(
            store.child_counts("a1").await,
            ChildCounts {
                employments: 1,
                publications: 1,
                apply_channels: 1,
                descriptions: 3,
                occupations: 0,
            }
        );
    }

    #[tokio::test]
    async fn shared_employer_resolves_to_one_row() {
        let store = MemoryStore::new();
        let a = store.upsert_job(&job("a1", "Acme AG", &["de"])).await.unwrap();
        let b = store.upsert_job(&job("b2", "Acme AG", &["de"])).await.unwrap();
        let c = store.upsert_job(&job("c3", "Other GmbH", &["de"])).await.unwrap();

        assert_eq!(a.company_id, b.company_id);
        assert_ne!(a.company_id, c.company_id);
        assert_eq!(store.company_count().await, 2);
        assert_eq!(store.location_count().await, 1);
    }

    #[tokio::test]
    async fn shrinking_description_set_shrinks_storage() {
        let store = MemoryStore::new();
        store.upsert_job(&job("a1", "Acme AG", &["de", "fr", "it"])).await.unwrap();
        store.upsert_job(&job("a1", "Acme AG", &["en"])).await.unwrap();

        let rows = store.descriptions("a1").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].language_iso_code, "en");
    }

    #[tokio::test]
    async fn failed_upsert_leaves_no_reference_rows_behind() {
        let store = MemoryStore::new();
        store.upsert_job(&job("a1", "Acme AG", &["de"])).await.unwrap();

        let err = store.upsert_job(&job("", "Brand New SA", &["de"])).await.unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
        assert_eq!(store.company_count().await, 1);
        assert_eq!(store.count_jobs().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rolled_back_reference_rows_free_their_ids() {
        let store = MemoryStore::new();
        store.upsert_job(&job("", "Brand New SA", &["de"])).await.unwrap_err();
        assert_eq!(store.location_count().await, 0);

        let receipt = store.upsert_job(&job("a1", "Acme AG", &["de"])).await.unwrap();
        assert_eq!((receipt.company_id, receipt.location_id), (1, 1));
        assert_eq!(store.child_counts("a1").await.descriptions, 1);
        assert_eq!(store.child_counts("missing").await, ChildCounts::default());
    }

    #[tokio::test]
    async fn blank_but_non_empty_id_is_accepted_like_postgres() {
        let store = MemoryStore::new();
        let receipt = store.upsert_job(&job(" ", "Acme AG", &["de"])).await.unwrap();
        assert_eq!(receipt.outcome, UpsertOutcome::Inserted);
        assert_eq!(store.count_jobs().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_keeps_original_created_time() {
        let store = MemoryStore::new();
        store.upsert_job(&job("a1", "Acme AG", &["de"])).await.unwrap();

        let mut changed = job("a1", "Acme AG", &["de"]);
        changed.created_time = "2030-01-01T00:00:00Z".into();
        changed.updated_time = "2026-02-01T00:00:00Z".into();
        store.upsert_job(&changed).await.unwrap();

        let stored = store.job("a1").await.unwrap();
        assert_eq!(stored.created_time, "2026-01-01T08:00:00Z");
        assert_eq!(
            store.stored_updated_time("a1").await.unwrap().as_deref(),
            Some("2026-02-01T00:00:00Z")
        );
        assert_eq!(store.stored_updated_time("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn runs_close_exactly_once_and_abandoned_runs_are_reaped() {
        let store = MemoryStore::new();
        let filters = serde_json::json!({"cantons": ["ZH"]});
        let run_id = store.open_run(Strategy::Incremental, &filters).await.unwrap();
        assert_eq!(store.get_run(run_id).await.unwrap().status, RunStatus::Running);

        let report = RunReport {
            run_id,
            status: RunStatus::Completed,
            stop_reason: StopReason::EmptyPage,
            counters: RunCounters { inserted: 4, pages_scraped: 1, ..RunCounters::default() },
            errors: vec!["page 0: boom".into(), "job x: gone".into()],
        };
        store.close_run(&report).await.unwrap();
        assert!(matches!(
            store.close_run(&report).await,
            Err(StoreError::RunAlreadyClosed(_))
        ));

        let closed = store.get_run(run_id).await.unwrap();
        assert_eq!(closed.status, RunStatus::Completed);
        assert_eq!(closed.stop_reason.as_deref(), Some("no more jobs"));
        assert_eq!(closed.error_log.as_deref(), Some("page 0: boom\njob x: gone"));
        assert_eq!(closed.filters, filters);

        let orphan = store.open_run(Strategy::Full, &JsonValue::Null).await.unwrap();
        let reaped = store
            .reap_abandoned_runs(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(reaped, 1);
        let orphan = store.get_run(orphan).await.unwrap();
        assert_eq!(orphan.status, RunStatus::Failed);
        assert_eq!(orphan.error_log.as_deref(), Some(ABANDONED_RUN_NOTE));
        assert_eq!(store.list_runs(10).await.unwrap().len(), 2);
    }
}
