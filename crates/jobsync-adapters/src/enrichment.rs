use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("enrichment is disabled (processing mode none)")]
    Disabled,
    #[error("unknown processing mode `{0}` (expected none, process, normalize or translate)")]
    UnknownMode(String),
    #[error("enrichment request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("enrichment service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("decoding enrichment response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    #[default]
    None,
    Process,
    Normalize,
    Translate,
}

impl ProcessingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingMode::None => "none",
            ProcessingMode::Process => "process",
            ProcessingMode::Normalize => "normalize",
            ProcessingMode::Translate => "translate",
        }
    }

    pub fn is_enabled(self) -> bool {
        self != ProcessingMode::None
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingMode {
    type Err = EnrichmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(ProcessingMode::None),
            "process" => Ok(ProcessingMode::Process),
            "normalize" => Ok(ProcessingMode::Normalize),
            "translate" => Ok(ProcessingMode::Translate),
            other => Err(EnrichmentError::UnknownMode(other.to_string())),
        }
    }
}

/// Reply from the enrichment service. Both camelCase and snake_case spellings
/// are accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EnrichmentOutcome {
    #[serde(default, alias = "jobId")]
    pub job_id: Option<String>,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, alias = "skipReason")]
    pub skip_reason: Option<String>,
    #[serde(default, alias = "savedToDB", alias = "savedToDb")]
    pub saved_to_db: bool,
}

/// Optional post-persist hook. Failures here never fail the record.
#[async_trait]
pub trait EnrichmentGateway: Send + Sync {
    async fn enrich(&self, job_id: &str) -> Result<EnrichmentOutcome, EnrichmentError>;
}

#[derive(Debug, Clone)]
pub struct AiServiceClient {
    client: reqwest::Client,
    base_url: String,
    mode: ProcessingMode,
}

impl AiServiceClient {
    pub fn new(
        base_url: impl Into<String>,
        mode: ProcessingMode,
        timeout: Duration,
    ) -> Result<Self, EnrichmentError> {
        if !mode.is_enabled() {
            return Err(EnrichmentError::Disabled);
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            mode,
        })
    }

    pub fn mode(&self) -> ProcessingMode {
        self.mode
    }

    pub fn endpoint(&self, job_id: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.mode, job_id)
    }

    pub async fn health_check(&self) -> Result<(), EnrichmentError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(EnrichmentError::Status {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl EnrichmentGateway for AiServiceClient {
    async fn enrich(&self, job_id: &str) -> Result<EnrichmentOutcome, EnrichmentError> {
        let span = info_span!("enrich", job_id, mode = %self.mode);
        async {
            let response = self
                .client
                .post(self.endpoint(job_id))
                .header(CONTENT_TYPE, "application/json")
                .body("{}")
                .send()
                .await?;
            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                return Err(EnrichmentError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            let outcome: EnrichmentOutcome = serde_json::from_str(&body)?;
            debug!(
                skipped = outcome.skipped,
                saved_to_db = outcome.saved_to_db,
                "enrichment finished"
            );
            Ok(outcome)
        }
        .instrument(span)
        .await
    }
}
