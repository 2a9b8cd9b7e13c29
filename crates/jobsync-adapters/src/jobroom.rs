use std::time::Duration;

use async_trait::async_trait;
use jobsync_core::{JobDetail, JobSummary, ScrapeRequest, PAGE_SIZE};
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, CONTENT_TYPE, ORIGIN, PRAGMA, REFERER, USER_AGENT,
};
use reqwest::{Method, RequestBuilder, Url};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info_span, warn, Instrument};

use crate::http::{
    is_result_limit, random_user_agent, FetchError, Politeness, RetryDisposition, RetryPolicy,
};
use crate::JobSource;

pub const DEFAULT_BASE_URL: &str = "https://www.job-room.ch/jobadservice/api/jobAdvertisements";

/// Every upstream call carries the base64 UI language marker (`en`).
const LANGUAGE_PARAM: (&str, &str) = ("_ng", "ZW4=");
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone)]
pub struct JobRoomConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub politeness: Politeness,
    pub retry: RetryPolicy,
}

impl Default for JobRoomConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            politeness: Politeness::default(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "jobAdvertisement")]
    job_advertisement: JobSummary,
}

/// HTTP client for the job-room search and detail endpoints.
#[derive(Debug)]
pub struct JobRoomClient {
    client: reqwest::Client,
    base_url: Url,
    politeness: Politeness,
    retry: RetryPolicy,
}

impl JobRoomClient {
    pub fn new(config: JobRoomConfig) -> Result<Self, FetchError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|err| FetchError::InvalidUrl(format!("{}: {err}", config.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(FetchError::InvalidUrl(config.base_url));
        }

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            base_url,
            politeness: config.politeness,
            retry: config.retry,
        })
    }

    pub fn search_url(&self, page: u32) -> Result<Url, FetchError> {
        self.endpoint(
            "_search",
            &[
                ("page", page.to_string()),
                ("size", PAGE_SIZE.to_string()),
                ("sort", "date_desc".to_string()),
            ],
        )
    }

    pub fn detail_url(&self, id: &str) -> Result<Url, FetchError> {
        if id.trim().is_empty() {
            return Err(FetchError::InvalidUrl("empty job id".to_string()));
        }
        self.endpoint(id, &[])
    }

    fn endpoint(&self, segment: &str, query: &[(&str, String)]) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push(segment);
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
            pairs.append_pair(LANGUAGE_PARAM.0, LANGUAGE_PARAM.1);
        }
        Ok(url)
    }

    fn browser_request(&self, method: Method, url: &Url) -> RequestBuilder {
        let origin = self.base_url.origin().ascii_serialization();
        self.client
            .request(method, url.clone())
            .header(USER_AGENT, random_user_agent())
            .header(ACCEPT, "application/json, text/plain, */*")
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9,de;q=0.8")
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache")
            .header(REFERER, format!("{origin}/home/job-seeker"))
            .header(ORIGIN, origin)
    }

    /// One upstream operation: politeness pause, then the retry loop.
    async fn execute(
        &self,
        method: Method,
        url: &Url,
        body: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, FetchError> {
        if let Some(delay) = self.politeness.sample_delay() {
            debug!(delay_ms = delay.as_millis() as u64, "politeness delay");
            tokio::time::sleep(delay).await;
        }

        let mut attempt = 0u32;
        loop {
            let mut request = self.browser_request(method.clone(), url);
            if let Some(body) = &body {
                request = request
                    .header(CONTENT_TYPE, "application/json")
                    .body(body.clone());
            }

            match self.attempt(url, request).await {
                Ok(bytes) => return Ok(bytes),
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < self.retry.max_retries =>
                {
                    attempt += 1;
                    let delay = self.retry.backoff.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying upstream request"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt(&self, url: &Url, request: RequestBuilder) -> Result<Vec<u8>, FetchError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.bytes().await?.to_vec());
        }

        let body = response.text().await.unwrap_or_default();
        if is_result_limit(status, &body) {
            return Err(FetchError::ResultLimit {
                status: status.as_u16(),
            });
        }
        Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
            body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
        })
    }
}

#[async_trait]
impl JobSource for JobRoomClient {
    async fn fetch_page(
        &self,
        request: &ScrapeRequest,
        page: u32,
    ) -> Result<Vec<JobSummary>, FetchError> {
        let url = self.search_url(page)?;
        let span = info_span!("upstream_fetch", kind = "search", page);
        async {
            let body = serde_json::to_vec(&request.search_body()).map_err(|source| {
                FetchError::Json {
                    url: url.to_string(),
                    source,
                }
            })?;
            let bytes = self.execute(Method::POST, &url, Some(body)).await?;
            if bytes.iter().all(u8::is_ascii_whitespace) {
                return Ok(Vec::new());
            }

            let hits: Vec<SearchHit> =
                serde_json::from_slice(&bytes).map_err(|source| FetchError::Json {
                    url: url.to_string(),
                    source,
                })?;
            debug!(hits = hits.len(), "search page decoded");
            Ok(hits.into_iter().map(|hit| hit.job_advertisement).collect())
        }
        .instrument(span)
        .await
    }

    async fn fetch_detail(&self, id: &str) -> Result<JobDetail, FetchError> {
        let url = self.detail_url(id)?;
        let span = info_span!("upstream_fetch", kind = "detail", job_id = id);
        async {
            let bytes = self.execute(Method::GET, &url, None).await?;
            let json_error = |source| FetchError::Json {
                url: url.to_string(),
                source,
            };
            let raw: JsonValue = serde_json::from_slice(&bytes).map_err(json_error)?;
            JobDetail::from_raw(raw).map_err(json_error)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> JobRoomClient {
        JobRoomClient::new(JobRoomConfig {
            base_url: base.to_string(),
            politeness: Politeness::disabled(),
            ..JobRoomConfig::default()
        })
        .expect("client")
    }

    #[test]
    fn search_url_carries_paging_and_language() {
        let url = client(DEFAULT_BASE_URL).search_url(3).unwrap();
        assert_eq!(url.path(), "/jobadservice/api/jobAdvertisements/_search");
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(query.contains(&("page".into(), "3".into())));
        assert!(query.contains(&("size".into(), "20".into())));
        assert!(query.contains(&("sort".into(), "date_desc".into())));
        assert!(query.contains(&("_ng".into(), "ZW4=".into())));
    }

    #[test]
    fn detail_url_handles_trailing_slash_and_rejects_empty_id() {
        let client = client("http://localhost:8080/api/jobs/");
        let url = client.detail_url("abc-123").unwrap();
        assert_eq!(url.path(), "/api/jobs/abc-123");
        assert!(matches!(
            client.detail_url("  "),
            Err(FetchError::InvalidUrl(_))
        ));
    }

    #[test]
    fn rejects_unparseable_base_url() {
        let err = JobRoomClient::new(JobRoomConfig {
            base_url: "not a url".into(),
            ..JobRoomConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }
}
