//! Normalization store and run telemetry for jobsync.
//!
//! A job upsert is one transaction: employer and location are resolved by
//! natural key, the job row is upserted, then every child table is cleared for
//! that job and refilled from the payload. Readers never observe an existing
//! job with zero child rows because the delete and the reinsert commit together.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use jobsync_core::{
    parse_coordinate, parse_optional_date, parse_workload, ApplyChannel, JobDetail, Occupation,
    RunRecord, RunReport, Strategy,
};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod pg;

pub use memory::{ChildCounts, MemoryStore, StoredJob};
pub use pg::{PgStore, PgStoreConfig, MIGRATOR};

pub const CRATE_NAME: &str = "jobsync-storage";

/// Child tables owned by a job, cleared and refilled on every upsert.
pub const CHILD_TABLES: [&str; 5] = [
    "employments",
    "publications",
    "apply_channels",
    "job_descriptions",
    "occupations",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("run {0} not found")]
    RunNotFound(Uuid),
    #[error("run {0} was already finalised")]
    RunAlreadyClosed(Uuid),
    #[error("could not decode stored value: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Surrogate keys resolved for one upsert plus whether the job row was new.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertReceipt {
    pub company_id: i64,
    pub location_id: i64,
    pub outcome: UpsertOutcome,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Writes one job and all of its reference and child rows atomically.
    async fn upsert_job(&self, job: &JobDetail) -> Result<UpsertReceipt, StoreError>;

    /// Upstream update timestamp stored for `id`, if the job is known.
    async fn stored_updated_time(&self, id: &str) -> Result<Option<String>, StoreError>;

    async fn count_jobs(&self) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Inserts a `running` row and returns its id.
    async fn open_run(&self, strategy: Strategy, filters: &JsonValue) -> Result<Uuid, StoreError>;

    /// Moves a `running` row to its terminal status. Fails if the run is
    /// unknown or already terminal.
    async fn close_run(&self, report: &RunReport) -> Result<(), StoreError>;

    async fn get_run(&self, id: Uuid) -> Result<RunRecord, StoreError>;

    async fn list_runs(&self, limit: u32) -> Result<Vec<RunRecord>, StoreError>;

    /// Fails every run still `running` that started before `cutoff`.
    async fn reap_abandoned_runs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

pub const ABANDONED_RUN_NOTE: &str = "run abandoned: process exited before finalising";

#[derive(Debug, Clone, PartialEq)]
pub struct EmploymentRow {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub short_employment: bool,
    pub immediately: bool,
    pub permanent: bool,
    pub workload_min: Option<i32>,
    pub workload_max: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublicationRow {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub eures_display: bool,
    pub public_display: bool,
    pub restricted_display: Option<bool>,
    pub company_anonymous: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptionRow {
    pub language_iso_code: String,
    pub title: String,
    pub description: String,
}

/// Column values for every child table of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildRows {
    pub employment: EmploymentRow,
    pub publication: PublicationRow,
    pub apply_channel: ApplyChannel,
    pub descriptions: Vec<DescriptionRow>,
    pub occupations: Vec<Occupation>,
}

impl ChildRows {
    pub fn from_job(job: &JobDetail) -> Self {
        let content = &job.job_content;
        let employment = &content.employment;
        let publication = &job.publication;

        // one row per language; a repeated language keeps the later text
        let mut descriptions: Vec<DescriptionRow> = Vec::with_capacity(content.job_descriptions.len());
        for desc in &content.job_descriptions {
            let row = DescriptionRow {
                language_iso_code: desc.language_iso_code.clone(),
                title: desc.title.clone(),
                description: desc.description.clone(),
            };
            match descriptions
                .iter_mut()
                .find(|d| d.language_iso_code == row.language_iso_code)
            {
                Some(existing) => *existing = row,
                None => descriptions.push(row),
            }
        }

        Self {
            employment: EmploymentRow {
                start_date: parse_optional_date(employment.start_date.as_deref()),
                end_date: parse_optional_date(employment.end_date.as_deref()),
                short_employment: employment.short_employment,
                immediately: employment.immediately,
                permanent: employment.permanent,
                workload_min: parse_workload(&employment.workload_percentage_min),
                workload_max: parse_workload(&employment.workload_percentage_max),
            },
            publication: PublicationRow {
                start_date: parse_optional_date(publication.start_date.as_deref()),
                end_date: parse_optional_date(publication.end_date.as_deref()),
                eures_display: publication.eures_display,
                public_display: publication.public_display,
                restricted_display: publication.restricted_display,
                company_anonymous: publication.company_anonymous,
            },
            apply_channel: content.apply_channel.clone(),
            descriptions,
            occupations: content.occupations.clone(),
        }
    }
}

pub(crate) fn coordinates(job: &JobDetail) -> (Option<f64>, Option<f64>) {
    let coords = &job.job_content.location.coordinates;
    (parse_coordinate(&coords.lat), parse_coordinate(&coords.lon))
}

pub(crate) fn number_of_jobs(job: &JobDetail) -> Option<i32> {
    parse_workload(&job.job_content.number_of_jobs)
}

pub(crate) fn counter(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobsync_core::{JobDescription, Publication};

    #[test]
    fn child_rows_collapse_repeated_languages_and_parse_dates() {
        let mut job = JobDetail {
            id: "j1".into(),
            publication: Publication {
                start_date: Some("2026-04-01".into()),
                end_date: Some("garbage".into()),
                ..Publication::default()
            },
            ..JobDetail::default()
        };
        job.job_content.job_descriptions = vec![
            JobDescription {
                language_iso_code: "de".into(),
                title: "Alt".into(),
                description: String::new(),
            },
            JobDescription {
                language_iso_code: "fr".into(),
                title: "Titre".into(),
                description: String::new(),
            },
            JobDescription {
                language_iso_code: "de".into(),
                title: "Neu".into(),
                description: String::new(),
            },
        ];
        job.job_content.employment.workload_percentage_min = "40".into();

        let rows = ChildRows::from_job(&job);
        assert_eq!(rows.descriptions.len(), 2);
        assert_eq!(rows.descriptions[0].title, "Neu");
        assert_eq!(rows.descriptions[1].language_iso_code, "fr");
        assert_eq!(rows.publication.start_date, NaiveDate::from_ymd_opt(2026, 4, 1));
        assert_eq!(rows.publication.end_date, None);
        assert_eq!(rows.employment.workload_min, Some(40));
        assert_eq!(rows.employment.workload_max, None);
    }
}
