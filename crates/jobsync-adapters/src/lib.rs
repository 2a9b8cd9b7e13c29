//! Upstream contracts: the job source the runner pages through, and the
//! optional enrichment hook called after each persisted record.
//!
//! [`JobRoomClient`] talks to the live search/detail endpoints with a
//! politeness delay and linear retry. [`FixtureSource`] replays a captured
//! bundle from disk for offline runs and tests.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use jobsync_core::{JobDetail, JobSummary, ScrapeRequest};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;

mod enrichment;
mod http;
mod jobroom;

pub use enrichment::{
    AiServiceClient, EnrichmentError, EnrichmentGateway, EnrichmentOutcome, ProcessingMode,
};
pub use http::{
    classify_reqwest_error, classify_status, is_result_limit, random_user_agent, BackoffPolicy,
    ExponentialBackoff, FetchError, LinearBackoff, Politeness, RetryDisposition, RetryPolicy,
    RESULT_LIMIT_MARKER, USER_AGENTS,
};
pub use jobroom::{JobRoomClient, JobRoomConfig, DEFAULT_BASE_URL};

pub const CRATE_NAME: &str = "jobsync-adapters";

/// Paged listing plus per-id detail lookup. Pages are zero-based.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn fetch_page(
        &self,
        request: &ScrapeRequest,
        page: u32,
    ) -> Result<Vec<JobSummary>, FetchError>;

    async fn fetch_detail(&self, id: &str) -> Result<JobDetail, FetchError>;
}

/// Captured upstream responses: search pages in order, details keyed by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub pages: Vec<Vec<JobSummary>>,
    #[serde(default)]
    pub details: BTreeMap<String, JsonValue>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Replays a [`FixtureBundle`]. Search filters are ignored; a page past the
/// end is empty and an unknown detail id answers like an upstream 404.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    bundle: FixtureBundle,
}

impl FixtureSource {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self { bundle }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_bundle(path)?))
    }

    pub fn bundle(&self) -> &FixtureBundle {
        &self.bundle
    }
}

#[async_trait]
impl JobSource for FixtureSource {
    async fn fetch_page(
        &self,
        _request: &ScrapeRequest,
        page: u32,
    ) -> Result<Vec<JobSummary>, FetchError> {
        Ok(self
            .bundle
            .pages
            .get(page as usize)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_detail(&self, id: &str) -> Result<JobDetail, FetchError> {
        let raw = self
            .bundle
            .details
            .get(id)
            .cloned()
            .ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                url: format!("fixture://{id}"),
                body: "not present in fixture bundle".to_string(),
            })?;
        JobDetail::from_raw(raw).map_err(|source| FetchError::Json {
            url: format!("fixture://{id}"),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    #[tokio::test]
    async fn sample_fixture_replays_pages_and_details() {
        let source =
            FixtureSource::from_path(workspace_root().join("fixtures/jobroom/sample/bundle.json"))
                .expect("load fixture");
        let request = ScrapeRequest::default();

        let first = source.fetch_page(&request, 0).await.unwrap();
        assert!(!first.is_empty());
        assert!(source
            .fetch_page(&request, source.bundle().pages.len() as u32)
            .await
            .unwrap()
            .is_empty());

        let detail = source.fetch_detail(&first[0].id).await.unwrap();
        assert_eq!(detail.id, first[0].id);
        assert_eq!(detail.snapshot(), source.bundle().details[&first[0].id]);
    }

    #[tokio::test]
    async fn missing_detail_is_a_non_retryable_404() {
        let source = FixtureSource::new(FixtureBundle::default());
        let err = source.fetch_detail("nope").await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
        assert!(!err.is_rate_limit());
    }
}
