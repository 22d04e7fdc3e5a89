use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use snafu::Snafu;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_RUN_POLL_INTERVAL: Duration = Duration::from_millis(1_000);
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub api_key: String,
    pub base_url: String,
    pub run_poll_interval: Duration,
    pub run_timeout: Duration,
}

impl ProviderConfig {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        Self {
            api_key: api_key.into().trim().to_string(),
            base_url: if base_url.is_empty() {
                DEFAULT_BASE_URL.to_string()
            } else {
                base_url
            },
            run_poll_interval: DEFAULT_RUN_POLL_INTERVAL,
            run_timeout: DEFAULT_RUN_TIMEOUT,
        }
    }

    pub fn with_run_poll_interval(mut self, interval: Duration) -> Self {
        self.run_poll_interval = interval;
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for the assistants API"))]
    MissingApiKey { stage: &'static str },
    #[snafu(display("API key cannot be sent as an HTTP header on `{stage}`: {source}"))]
    InvalidApiKey {
        stage: &'static str,
        source: reqwest::header::InvalidHeaderValue,
    },
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildHttpClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display(
        "request to {endpoint} failed before any response arrived; this is usually a CORS or network limitation: {source}"
    ))]
    NetworkUnavailable {
        stage: &'static str,
        endpoint: String,
        source: reqwest::Error,
    },
    #[snafu(display("{message}"))]
    HttpStatus {
        stage: &'static str,
        status: u16,
        message: String,
    },
    #[snafu(display("failed to read response body on `{stage}`: {source}"))]
    ReadBody {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("unexpected response payload on `{stage}`: {source}"))]
    DecodePayload {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("assistant run {run_id} ended with status '{status}'"))]
    RunFailed {
        stage: &'static str,
        run_id: String,
        status: String,
    },
    #[snafu(display("assistant run {run_id} did not finish within {waited:?}"))]
    RunTimedOut {
        stage: &'static str,
        run_id: String,
        waited: Duration,
    },
    #[snafu(display("remote thread {thread_id} has no assistant reply"))]
    MissingAssistantReply {
        stage: &'static str,
        thread_id: String,
    },
    #[snafu(display("failed to parse provider model list: {details}"))]
    ModelPayloadParse {
        stage: &'static str,
        details: String,
    },
}

impl ProviderError {
    /// HTTP status for errors that carried a response, `None` for everything else.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_network_unavailable(&self) -> bool {
        matches!(self, Self::NetworkUnavailable { .. })
    }
}
