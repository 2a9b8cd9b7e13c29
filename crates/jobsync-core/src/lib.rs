//! Core domain model for jobsync: scrape filters, upstream payload shapes and run bookkeeping.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobsync-core";

/// Upstream page size; fixed by the search endpoint contract.
pub const PAGE_SIZE: u32 = 20;

pub const SWISS_CANTONS: [&str; 26] = [
    "AG", "AI", "AR", "BE", "BL", "BS", "FR", "GE", "GL", "GR", "JU", "LU", "NE", "NW", "OW",
    "SG", "SH", "SO", "SZ", "TG", "TI", "UR", "VD", "VS", "ZG", "ZH",
];

pub fn is_valid_canton(code: &str) -> bool {
    SWISS_CANTONS
        .iter()
        .any(|c| c.eq_ignore_ascii_case(code.trim()))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("unknown strategy {0:?} (expected \"full\" or \"incremental\")")]
    UnknownStrategy(String),
    #[error("unknown canton code {0:?}")]
    UnknownCanton(String),
    #[error("workload {field} must be between 0 and 100, got {value}")]
    WorkloadOutOfRange { field: &'static str, value: u32 },
    #[error("workload_min ({min}) is greater than workload_max ({max})")]
    WorkloadInverted { min: u32, max: u32 },
    #[error("unknown run status {0:?}")]
    UnknownStatus(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Full,
    Incremental,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => Err(FilterError::UnknownStrategy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRequest {
    pub strategy: Strategy,
    /// Zero means no page cap.
    pub max_pages: u32,
    pub start_page: u32,
    /// Whitespace separated; split into the upstream keyword list.
    pub keywords: String,
    pub cantons: Vec<String>,
    pub workload_min: u32,
    pub workload_max: u32,
    /// `None` matches both permanent and temporary contracts.
    pub permanent: Option<bool>,
    pub days_back: u32,
    pub polite: bool,
}

impl Default for ScrapeRequest {
    fn default() -> Self {
        Self {
            strategy: Strategy::Full,
            max_pages: 5,
            start_page: 0,
            keywords: String::new(),
            cantons: Vec::new(),
            workload_min: 10,
            workload_max: 100,
            permanent: None,
            days_back: 60,
            polite: true,
        }
    }
}

impl ScrapeRequest {
    /// Checks canton codes and workload bounds, upper-casing cantons in place.
    pub fn validate(&mut self) -> Result<(), FilterError> {
        for canton in &mut self.cantons {
            if !is_valid_canton(canton) {
                return Err(FilterError::UnknownCanton(canton.clone()));
            }
            *canton = canton.trim().to_ascii_uppercase();
        }
        if self.workload_min > 100 {
            return Err(FilterError::WorkloadOutOfRange {
                field: "workload_min",
                value: self.workload_min,
            });
        }
        if self.workload_max > 100 {
            return Err(FilterError::WorkloadOutOfRange {
                field: "workload_max",
                value: self.workload_max,
            });
        }
        if self.workload_max > 0 && self.workload_min > self.workload_max {
            return Err(FilterError::WorkloadInverted {
                min: self.workload_min,
                max: self.workload_max,
            });
        }
        Ok(())
    }

    pub fn keyword_list(&self) -> Vec<String> {
        self.keywords.split_whitespace().map(str::to_string).collect()
    }

    pub fn search_body(&self) -> SearchRequestBody {
        let workload_min = if self.workload_min == 0 { 10 } else { self.workload_min };
        let workload_max = if self.workload_max == 0 || self.workload_max > 100 {
            100
        } else {
            self.workload_max
        };
        let online_since = if self.days_back == 0 { 60 } else { self.days_back };

        SearchRequestBody {
            workload_percentage_min: workload_min,
            workload_percentage_max: workload_max,
            permanent: self.permanent,
            company_name: None,
            online_since,
            display_restricted: false,
            profession_codes: Vec::new(),
            keywords: self.keyword_list(),
            communal_codes: Vec::new(),
            canton_codes: self.cantons.clone(),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequestBody {
    pub workload_percentage_min: u32,
    pub workload_percentage_max: u32,
    pub permanent: Option<bool>,
    pub company_name: Option<String>,
    pub online_since: u32,
    pub display_restricted: bool,
    pub profession_codes: Vec<String>,
    pub keywords: Vec<String>,
    pub communal_codes: Vec<String>,
    pub canton_codes: Vec<String>,
}

/// Lightweight search hit. Timestamps stay opaque strings: the cutoff compares
/// them for equality against what was stored, never orders them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct JobSummary {
    pub id: String,
    pub created_time: String,
    pub updated_time: String,
    pub status: String,
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct JobDetail {
    pub id: String,
    pub created_time: String,
    pub updated_time: String,
    pub status: String,
    pub source_system: String,
    pub external_reference: String,
    pub stellennummer_egov: String,
    pub fingerprint: Option<String>,
    pub reporting_obligation: bool,
    pub job_content: JobContent,
    pub publication: Publication,
    /// Verbatim detail body, persisted as the payload snapshot.
    #[serde(skip)]
    pub raw_data: JsonValue,
}

impl JobDetail {
    pub fn from_raw(raw: JsonValue) -> Result<Self, serde_json::Error> {
        let mut detail: JobDetail = serde_json::from_value(raw.clone())?;
        detail.raw_data = raw;
        Ok(detail)
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            created_time: self.created_time.clone(),
            updated_time: self.updated_time.clone(),
            status: self.status.clone(),
            fingerprint: self.fingerprint.clone(),
        }
    }

    /// Snapshot to persist; falls back to re-encoding when no raw body was captured.
    pub fn snapshot(&self) -> JsonValue {
        if self.raw_data.is_null() {
            serde_json::to_value(self).unwrap_or(JsonValue::Null)
        } else {
            self.raw_data.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct JobContent {
    pub external_url: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub number_of_jobs: String,
    pub job_descriptions: Vec<JobDescription>,
    pub company: Company,
    pub employment: Employment,
    pub location: Location,
    pub occupations: Vec<Occupation>,
    pub apply_channel: ApplyChannel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct JobDescription {
    pub language_iso_code: String,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Company {
    pub name: String,
    pub street: Option<String>,
    pub house_number: Option<String>,
    pub postal_code: String,
    pub city: String,
    pub country_iso_code: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub surrogate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompanyKey {
    pub name: String,
    pub postal_code: String,
    pub city: String,
}

impl Company {
    pub fn natural_key(&self) -> CompanyKey {
        CompanyKey {
            name: self.name.clone(),
            postal_code: self.postal_code.clone(),
            city: self.city.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Employment {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub short_employment: bool,
    pub immediately: bool,
    pub permanent: bool,
    #[serde(deserialize_with = "lenient_string")]
    pub workload_percentage_min: String,
    #[serde(deserialize_with = "lenient_string")]
    pub workload_percentage_max: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Location {
    pub remarks: Option<String>,
    pub city: String,
    pub postal_code: String,
    pub communal_code: Option<String>,
    pub region_code: Option<String>,
    pub canton_code: String,
    pub country_iso_code: Option<String>,
    pub coordinates: Coordinates,
}

/// Location dedup key: postal code + city + canton (the upstream region filter code).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocationKey {
    pub postal_code: String,
    pub city: String,
    pub canton_code: String,
}

impl Location {
    pub fn natural_key(&self) -> LocationKey {
        LocationKey {
            postal_code: self.postal_code.clone(),
            city: self.city.clone(),
            canton_code: self.canton_code.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Coordinates {
    #[serde(deserialize_with = "lenient_string")]
    pub lat: String,
    #[serde(deserialize_with = "lenient_string")]
    pub lon: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Occupation {
    pub avam_occupation_code: String,
    pub work_experience: Option<String>,
    pub education_code: Option<String>,
    pub qualification_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ApplyChannel {
    pub raw_post_address: Option<String>,
    pub post_address: Option<String>,
    pub email_address: Option<String>,
    pub phone_number: Option<String>,
    pub form_url: Option<String>,
    pub additional_info: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Publication {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub eures_display: bool,
    pub public_display: bool,
    pub restricted_display: Option<bool>,
    pub company_anonymous: Option<bool>,
}

/// Accepts a JSON string, number or bool (or null) and yields its text form.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s,
        Some(other) => other.to_string(),
    })
}

pub fn parse_date(input: &str) -> Option<NaiveDate> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Some(ts.date_naive());
    }
    ["%Y-%m-%dT%H:%M:%S%.fZ", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
        .map(|ts| ts.date())
}

pub fn parse_optional_date(input: Option<&str>) -> Option<NaiveDate> {
    input.and_then(parse_date)
}

pub fn parse_workload(input: &str) -> Option<i32> {
    let input = input.trim();
    input
        .parse::<i32>()
        .ok()
        .or_else(|| input.parse::<f64>().ok().map(|v| v.round() as i32))
}

pub fn parse_coordinate(input: &str) -> Option<f64> {
    input.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Cancellation wins over everything; the error threshold always fails the
    /// run; otherwise a run that logged errors but wrote nothing is a failure.
    pub fn derive(stop: StopReason, counters: &RunCounters, error_count: usize) -> Self {
        match stop {
            StopReason::Cancelled => Self::Cancelled,
            StopReason::ErrorThreshold => Self::Failed,
            StopReason::IncrementalCutoff
            | StopReason::RateLimited
            | StopReason::EmptyPage
            | StopReason::MaxPagesReached => {
                if error_count > 0 && counters.written() == 0 {
                    Self::Failed
                } else {
                    Self::Completed
                }
            }
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(FilterError::UnknownStatus(other.to_string())),
        }
    }
}

/// Why the page loop ended. Every variant is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    IncrementalCutoff,
    RateLimited,
    ErrorThreshold,
    EmptyPage,
    MaxPagesReached,
    Cancelled,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IncrementalCutoff => "incremental cutoff reached",
            Self::RateLimited => "upstream result limit reached",
            Self::ErrorThreshold => "too many consecutive errors",
            Self::EmptyPage => "no more jobs",
            Self::MaxPagesReached => "max pages reached",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunCounters {
    pub processed: u32,
    pub inserted: u32,
    pub updated: u32,
    pub skipped: u32,
    pub pages_scraped: u32,
    pub ai_processed: u32,
    pub ai_skipped: u32,
    pub ai_failed: u32,
}

impl RunCounters {
    pub fn written(&self) -> u32 {
        self.inserted + self.updated
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub stop_reason: StopReason,
    pub counters: RunCounters,
    pub errors: Vec<String>,
}

impl RunReport {
    pub fn error_log(&self) -> Option<String> {
        if self.errors.is_empty() {
            None
        } else {
            Some(self.errors.join("\n"))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub strategy: Strategy,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub stop_reason: Option<String>,
    pub counters: RunCounters,
    pub filters: JsonValue,
    pub error_log: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn search_body_applies_upstream_defaults() {
        let req = ScrapeRequest {
            keywords: "rust  engineer".into(),
            cantons: vec!["ZH".into()],
            workload_min: 0,
            workload_max: 0,
            days_back: 0,
            ..ScrapeRequest::default()
        };
        let body = req.search_body();
        assert_eq!(body.workload_percentage_min, 10);
        assert_eq!(body.workload_percentage_max, 100);
        assert_eq!(body.online_since, 60);
        assert_eq!(body.keywords, vec!["rust".to_string(), "engineer".to_string()]);

        let encoded = serde_json::to_value(&body).unwrap();
        assert_eq!(encoded["cantonCodes"], json!(["ZH"]));
        assert_eq!(encoded["professionCodes"], json!([]));
        assert_eq!(encoded["companyName"], JsonValue::Null);
        assert_eq!(encoded["displayRestricted"], json!(false));
    }

    #[test]
    fn validate_normalizes_cantons_and_rejects_bad_workloads() {
        let mut req = ScrapeRequest {
            cantons: vec!["zh".into(), " be ".into()],
            ..ScrapeRequest::default()
        };
        req.validate().unwrap();
        assert_eq!(req.cantons, vec!["ZH".to_string(), "BE".to_string()]);

        let mut bad = ScrapeRequest {
            cantons: vec!["XX".into()],
            ..ScrapeRequest::default()
        };
        assert_eq!(bad.validate(), Err(FilterError::UnknownCanton("XX".into())));

        let mut inverted = ScrapeRequest {
            workload_min: 80,
            workload_max: 40,
            ..ScrapeRequest::default()
        };
        assert_eq!(
            inverted.validate(),
            Err(FilterError::WorkloadInverted { min: 80, max: 40 })
        );
    }

    #[test]
    fn detail_accepts_numeric_or_string_fields_and_keeps_snapshot() {
        let raw = json!({
            "id": "abc",
            "updatedTime": "2026-01-02T10:00:00Z",
            "jobContent": {
                "numberOfJobs": 2,
                "employment": {"workloadPercentageMin": "80", "workloadPercentageMax": 100},
                "location": {"city": "Bern", "postalCode": "3000", "cantonCode": "BE",
                             "coordinates": {"lat": 46.94, "lon": "7.44"}},
                "jobDescriptions": [{"languageIsoCode": "de", "title": "T", "description": "D"}]
            },
            "unknownField": true
        });
        let detail = JobDetail::from_raw(raw.clone()).unwrap();
        assert_eq!(detail.job_content.number_of_jobs, "2");
        assert_eq!(detail.job_content.employment.workload_percentage_max, "100");
        assert_eq!(parse_coordinate(&detail.job_content.location.coordinates.lat), Some(46.94));
        assert_eq!(detail.raw_data, raw);
        assert_eq!(detail.snapshot(), raw);
    }

    #[test]
    fn date_parsing_accepts_the_upstream_variants() {
        let expected = NaiveDate::from_ymd_opt(2026, 3, 1);
        assert_eq!(parse_date("2026-03-01"), expected);
        assert_eq!(parse_date("2026-03-01T08:30:00Z"), expected);
        assert_eq!(parse_date("2026-03-01T08:30:00.000Z"), expected);
        assert_eq!(parse_date("2026-03-01T08:30:00+01:00"), expected);
        assert_eq!(parse_date("not a date"), None);
        assert_eq!(parse_date(""), None);
        assert_eq!(parse_workload("60"), Some(60));
        assert_eq!(parse_workload(""), None);
    }

    #[test]
    fn status_derivation_follows_stop_reason_and_writes() {
        let empty = RunCounters::default();
        let wrote = RunCounters { inserted: 1, ..RunCounters::default() };

        assert_eq!(RunStatus::derive(StopReason::Cancelled, &wrote, 3), RunStatus::Cancelled);
        assert_eq!(RunStatus::derive(StopReason::ErrorThreshold, &wrote, 10), RunStatus::Failed);
        assert_eq!(RunStatus::derive(StopReason::EmptyPage, &empty, 2), RunStatus::Failed);
        assert_eq!(RunStatus::derive(StopReason::EmptyPage, &wrote, 2), RunStatus::Completed);
        assert_eq!(RunStatus::derive(StopReason::RateLimited, &empty, 0), RunStatus::Completed);
    }

    #[test]
    fn strategy_round_trips_through_text() {
        assert_eq!("Incremental".parse::<Strategy>(), Ok(Strategy::Incremental));
        assert!("sometimes".parse::<Strategy>().is_err());
        assert_eq!(StopReason::IncrementalCutoff.to_string(), "incremental cutoff reached");
    }
}
