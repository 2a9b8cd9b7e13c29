use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::StatusCode;
use thiserror::Error;

pub const USER_AGENTS: [&str; 5] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

/// Body fragment the upstream uses to signal that its result window is exhausted.
pub const RESULT_LIMIT_MARKER: &str = "exceed max result limit";

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("upstream result limit reached (http status {status})")]
    ResultLimit { status: u16 },
    #[error("json error for {url}: {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl FetchError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, FetchError::ResultLimit { .. })
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::ResultLimit { .. }
            | FetchError::Json { .. }
            | FetchError::InvalidUrl(_) => RetryDisposition::NonRetryable,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } | FetchError::ResultLimit { status } => {
                Some(*status)
            }
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Client errors are final, except 429 which is worth another attempt.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::NonRetryable
    } else {
        RetryDisposition::Retryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_builder() {
        RetryDisposition::NonRetryable
    } else {
        RetryDisposition::Retryable
    }
}

pub fn is_result_limit(status: StatusCode, body: &str) -> bool {
    status == StatusCode::PRECONDITION_FAILED
        || body.to_ascii_lowercase().contains(RESULT_LIMIT_MARKER)
}

/// Delay before retry number `attempt` (1 for the first retry).
pub trait BackoffPolicy: fmt::Debug + Send + Sync {
    fn delay_for_attempt(&self, attempt: u32) -> Duration;
}

/// `attempt * base`: 1s, 2s, 3s with the default base.
#[derive(Debug, Clone, Copy)]
pub struct LinearBackoff {
    pub base_delay: Duration,
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl BackoffPolicy for LinearBackoff {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    pub backoff: Arc<dyn BackoffPolicy>,
}

impl RetryPolicy {
    pub fn linear(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: Arc::new(LinearBackoff { base_delay }),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Arc::new(LinearBackoff::default()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Politeness {
    pub enabled: bool,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Politeness {
    pub const DEFAULT_MIN: Duration = Duration::from_millis(2000);
    pub const DEFAULT_SPREAD: Duration = Duration::from_millis(3000);

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Uniform sample in `[min, max]`; a zero min falls back to 2s and a
    /// max not above min widens to `min + 3s`.
    pub fn sample_delay(&self) -> Option<Duration> {
        if !self.enabled {
            return None;
        }
        let min = if self.min_delay.is_zero() {
            Self::DEFAULT_MIN
        } else {
            self.min_delay
        };
        let max = if self.max_delay <= min {
            min + Self::DEFAULT_SPREAD
        } else {
            self.max_delay
        };
        let millis = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
        Some(Duration::from_millis(millis))
    }
}

impl Default for Politeness {
    fn default() -> Self {
        Self {
            enabled: true,
            min_delay: Self::DEFAULT_MIN,
            max_delay: Self::DEFAULT_MIN + Self::DEFAULT_SPREAD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_backoff_grows_by_base() {
        let policy = LinearBackoff::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(3));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = ExponentialBackoff {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn result_limit_detection() {
        assert!(is_result_limit(StatusCode::PRECONDITION_FAILED, ""));
        assert!(is_result_limit(
            StatusCode::BAD_REQUEST,
            r#"{"message":"Exceed max result limit of 10000"}"#
        ));
        assert!(!is_result_limit(StatusCode::TOO_MANY_REQUESTS, "slow down"));
    }

    #[test]
    fn politeness_sample_stays_in_window() {
        let politeness = Politeness {
            enabled: true,
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
        };
        for _ in 0..50 {
            let delay = politeness.sample_delay().unwrap();
            assert!(delay >= Duration::from_millis(10) && delay <= Duration::from_millis(20));
        }
        assert!(Politeness::disabled().sample_delay().is_none());
    }

    #[test]
    fn politeness_widens_degenerate_window() {
        let politeness = Politeness {
            enabled: true,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        let delay = politeness.sample_delay().unwrap();
        assert!(delay >= Duration::from_millis(2000) && delay <= Duration::from_millis(5000));
    }

    #[test]
    fn user_agent_comes_from_pool() {
        assert!(USER_AGENTS.contains(&random_user_agent()));
    }
}
