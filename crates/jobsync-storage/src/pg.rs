use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobsync_core::{
    Company, JobDetail, Location, RunCounters, RunRecord, RunReport, RunStatus, Strategy,
};
use serde_json::Value as JsonValue;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    coordinates, counter, number_of_jobs, ChildRows, JobStore, RunLedger, StoreError,
    UpsertOutcome, UpsertReceipt, ABANDONED_RUN_NOTE, CHILD_TABLES,
};

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Bounds pool acquisition and every statement on the connection.
    pub timeout: Duration,
}

impl PgStoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &PgStoreConfig) -> Result<Self, StoreError> {
        let statement_timeout = format!("{}ms", config.timeout.as_millis());
        let options = PgConnectOptions::from_str(&config.database_url)?
            .options([("statement_timeout", statement_timeout)]);
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.timeout)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

/// Insert-or-ignore then select, so concurrent writers converge on one row per
/// natural key without holding external locks.
async fn get_or_create_company(
    conn: &mut PgConnection,
    company: &Company,
) -> Result<i64, sqlx::Error> {
    let inserted: Option<i64> = sqlx::query_scalar(
        r#"
        INSERT INTO companies (
            name, street, house_number, postal_code, city,
            country_iso_code, phone, email, website, surrogate
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT ON CONSTRAINT companies_natural_key DO NOTHING
        RETURNING id
        "#,
    )
    .bind(&company.name)
    .bind(&company.street)
    .bind(&company.house_number)
    .bind(&company.postal_code)
    .bind(&company.city)
    .bind(&company.country_iso_code)
    .bind(&company.phone)
    .bind(&company.email)
    .bind(&company.website)
    .bind(company.surrogate)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(id) = inserted {
        return Ok(id);
    }

    sqlx::query_scalar(
        r#"
        SELECT id FROM companies
         WHERE name = $1 AND postal_code = $2 AND city = $3
        "#,
    )
    .bind(&company.name)
    .bind(&company.postal_code)
    .bind(&company.city)
    .fetch_one(&mut *conn)
    .await
}

async fn get_or_create_location(
    conn: &mut PgConnection,
    location: &Location,
    lat: Option<f64>,
    lon: Option<f64>,
) -> Result<i64, sqlx::Error> {
    let inserted: Option<i64> = sqlx::query_scalar(
        r#"
        INSERT INTO locations (
            remarks, city, postal_code, communal_code, region_code,
            canton_code, country_iso_code, lat, lon
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT ON CONSTRAINT locations_natural_key DO NOTHING
        RETURNING id
        "#,
    )
    .bind(&location.remarks)
    .bind(&location.city)
    .bind(&location.postal_code)
    .bind(&location.communal_code)
    .bind(&location.region_code)
    .bind(&location.canton_code)
    .bind(&location.country_iso_code)
    .bind(lat)
    .bind(lon)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(id) = inserted {
        return Ok(id);
    }

    sqlx::query_scalar(
        r#"
        SELECT id FROM locations
         WHERE postal_code = $1 AND city = $2 AND canton_code = $3
        "#,
    )
    .bind(&location.postal_code)
    .bind(&location.city)
    .bind(&location.canton_code)
    .fetch_one(&mut *conn)
    .await
}

async fn insert_child_rows(
    conn: &mut PgConnection,
    job_id: &str,
    rows: &ChildRows,
) -> Result<(), sqlx::Error> {
    let employment = &rows.employment;
    sqlx::query(
        r#"
        INSERT INTO employments (
            job_id, start_date, end_date, short_employment,
            immediately, permanent, workload_min, workload_max
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(job_id)
    .bind(employment.start_date)
    .bind(employment.end_date)
    .bind(employment.short_employment)
    .bind(employment.immediately)
    .bind(employment.permanent)
    .bind(employment.workload_min)
    .bind(employment.workload_max)
    .execute(&mut *conn)
    .await?;

    let publication = &rows.publication;
    sqlx::query(
        r#"
        INSERT INTO publications (
            job_id, start_date, end_date, eures_display,
            public_display, restricted_display, company_anonymous
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(job_id)
    .bind(publication.start_date)
    .bind(publication.end_date)
    .bind(publication.eures_display)
    .bind(publication.public_display)
    .bind(publication.restricted_display)
    .bind(publication.company_anonymous)
    .execute(&mut *conn)
    .await?;

    let channel = &rows.apply_channel;
    sqlx::query(
        r#"
        INSERT INTO apply_channels (
            job_id, raw_post_address, post_address, email_address,
            phone_number, form_url, additional_info
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(job_id)
    .bind(&channel.raw_post_address)
    .bind(&channel.post_address)
    .bind(&channel.email_address)
    .bind(&channel.phone_number)
    .bind(&channel.form_url)
    .bind(&channel.additional_info)
    .execute(&mut *conn)
    .await?;

    for desc in &rows.descriptions {
        sqlx::query(
            r#"
            INSERT INTO job_descriptions (job_id, language_iso_code, title, description)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(job_id)
        .bind(&desc.language_iso_code)
        .bind(&desc.title)
        .bind(&desc.description)
        .execute(&mut *conn)
        .await?;
    }

    for occ in &rows.occupations {
        sqlx::query(
            r#"
            INSERT INTO occupations (
                job_id, avam_occupation_code, work_experience,
                education_code, qualification_code
            ) VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(job_id)
        .bind(&occ.avam_occupation_code)
        .bind(&occ.work_experience)
        .bind(&occ.education_code)
        .bind(&occ.qualification_code)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

#[async_trait]
impl JobStore for PgStore {
    async fn upsert_job(&self, job: &JobDetail) -> Result<UpsertReceipt, StoreError> {
        let rows = ChildRows::from_job(job);
        let (lat, lon) = coordinates(job);

        // dropping `tx` on any early return rolls the whole upsert back
        let mut tx = self.pool.begin().await?;

        let company_id = get_or_create_company(&mut tx, &job.job_content.company).await?;
        let location_id =
            get_or_create_location(&mut tx, &job.job_content.location, lat, lon).await?;

        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (
                id, source, created_time, updated_time, status, source_system,
                external_ref, stellennummer_egov, fingerprint, reporting_obligation,
                external_url, number_of_jobs, raw_data, company_id, location_id
            ) VALUES ($1, 'jobroom', $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                updated_time = EXCLUDED.updated_time,
                status = EXCLUDED.status,
                source_system = EXCLUDED.source_system,
                external_ref = EXCLUDED.external_ref,
                stellennummer_egov = EXCLUDED.stellennummer_egov,
                fingerprint = EXCLUDED.fingerprint,
                reporting_obligation = EXCLUDED.reporting_obligation,
                external_url = EXCLUDED.external_url,
                number_of_jobs = EXCLUDED.number_of_jobs,
                raw_data = EXCLUDED.raw_data,
                company_id = EXCLUDED.company_id,
                location_id = EXCLUDED.location_id,
                updated_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&job.id)
        .bind(&job.created_time)
        .bind(&job.updated_time)
        .bind(&job.status)
        .bind(&job.source_system)
        .bind(&job.external_reference)
        .bind(&job.stellennummer_egov)
        .bind(&job.fingerprint)
        .bind(job.reporting_obligation)
        .bind(&job.job_content.external_url)
        .bind(number_of_jobs(job))
        .bind(job.snapshot())
        .bind(company_id)
        .bind(location_id)
        .fetch_one(&mut *tx)
        .await?;

        for table in CHILD_TABLES {
            sqlx::query(&format!("DELETE FROM {table} WHERE job_id = $1"))
                .bind(&job.id)
                .execute(&mut *tx)
                .await?;
        }
        insert_child_rows(&mut tx, &job.id, &rows).await?;

        tx.commit().await?;

        debug!(
            job_id = %job.id,
            company_id,
            location_id,
            inserted,
            descriptions = rows.descriptions.len(),
            occupations = rows.occupations.len(),
            "job upserted"
        );

        Ok(UpsertReceipt {
            company_id,
            location_id,
            outcome: if inserted {
                UpsertOutcome::Inserted
            } else {
                UpsertOutcome::Updated
            },
        })
    }

    async fn stored_updated_time(&self, id: &str) -> Result<Option<String>, StoreError> {
        let updated: Option<String> =
            sqlx::query_scalar("SELECT updated_time FROM jobs WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(updated)
    }

    async fn count_jobs(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

fn read_counter(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    let value: i32 = row.try_get(column)?;
    Ok(u32::try_from(value).unwrap_or_default())
}

fn run_from_row(row: &PgRow) -> Result<RunRecord, StoreError> {
    let strategy: String = row.try_get("strategy")?;
    let status: String = row.try_get("status")?;
    let filters: Option<JsonValue> = row.try_get("filters")?;

    Ok(RunRecord {
        id: row.try_get("id")?,
        strategy: strategy
            .parse::<Strategy>()
            .map_err(|e| StoreError::Decode(e.to_string()))?,
        started_at: row.try_get("start_time")?,
        finished_at: row.try_get("end_time")?,
        status: status
            .parse::<RunStatus>()
            .map_err(|e| StoreError::Decode(e.to_string()))?,
        stop_reason: row.try_get("stop_reason")?,
        counters: RunCounters {
            processed: read_counter(row, "jobs_processed")?,
            inserted: read_counter(row, "jobs_inserted")?,
            updated: read_counter(row, "jobs_updated")?,
            skipped: read_counter(row, "jobs_skipped")?,
            pages_scraped: read_counter(row, "pages_scraped")?,
            ai_processed: read_counter(row, "ai_processed")?,
            ai_skipped: read_counter(row, "ai_skipped")?,
            ai_failed: read_counter(row, "ai_failed")?,
        },
        filters: filters.unwrap_or(JsonValue::Null),
        error_log: row.try_get("error_log")?,
    })
}

const RUN_COLUMNS: &str = r#"
    id, strategy, start_time, end_time, status, stop_reason,
    jobs_processed, jobs_inserted, jobs_updated, jobs_skipped, pages_scraped,
    ai_processed, ai_skipped, ai_failed, filters, error_log
"#;

#[async_trait]
impl RunLedger for PgStore {
    async fn open_run(&self, strategy: Strategy, filters: &JsonValue) -> Result<Uuid, StoreError> {
        let run_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO scrape_runs (id, strategy, start_time, status, filters)
            VALUES ($1, $2, NOW(), 'running', $3)
            "#,
        )
        .bind(run_id)
        .bind(strategy.as_str())
        .bind(filters)
        .execute(&self.pool)
        .await?;
        Ok(run_id)
    }

    async fn close_run(&self, report: &RunReport) -> Result<(), StoreError> {
        let counters = &report.counters;
        let result = sqlx::query(
            r#"
            UPDATE scrape_runs
               SET status = $1,
                   stop_reason = $2,
                   end_time = NOW(),
                   jobs_processed = $3,
                   jobs_inserted = $4,
                   jobs_updated = $5,
                   jobs_skipped = $6,
                   pages_scraped = $7,
                   ai_processed = $8,
                   ai_skipped = $9,
                   ai_failed = $10,
                   error_log = $11,
                   updated_at = NOW()
             WHERE id = $12
               AND status = 'running'
            "#,
        )
        .bind(report.status.as_str())
        .bind(report.stop_reason.as_str())
        .bind(counter(counters.processed))
        .bind(counter(counters.inserted))
        .bind(counter(counters.updated))
        .bind(counter(counters.skipped))
        .bind(counter(counters.pages_scraped))
        .bind(counter(counters.ai_processed))
        .bind(counter(counters.ai_skipped))
        .bind(counter(counters.ai_failed))
        .bind(report.error_log())
        .bind(report.run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let exists: Option<String> = sqlx::query_scalar("SELECT status FROM scrape_runs WHERE id = $1")
            .bind(report.run_id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Err(StoreError::RunAlreadyClosed(report.run_id)),
            None => Err(StoreError::RunNotFound(report.run_id)),
        }
    }

    async fn get_run(&self, id: Uuid) -> Result<RunRecord, StoreError> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM scrape_runs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::RunNotFound(id))?;
        run_from_row(&row)
    }

    async fn list_runs(&self, limit: u32) -> Result<Vec<RunRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM scrape_runs ORDER BY start_time DESC LIMIT $1"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn reap_abandoned_runs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_runs
               SET status = 'failed',
                   end_time = NOW(),
                   error_log = CASE
                       WHEN error_log IS NULL OR error_log = '' THEN $1
                       ELSE error_log || E'\n' || $1
                   END,
                   updated_at = NOW()
             WHERE status = 'running'
               AND start_time < $2
            "#,
        )
        .bind(ABANDONED_RUN_NOTE)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
