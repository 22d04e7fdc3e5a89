use snafu::Snafu;
use storefront_llm::ProviderError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CatalogError {
    #[snafu(display("failed to build webhook http client: {source}"))]
    BuildHttpClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("no webhook configured for {operation}"))]
    WebhookNotConfigured {
        stage: &'static str,
        operation: &'static str,
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
        endpoint: String,
        status: u16,
        message: String,
    },
    #[snafu(display("failed to read response body from {endpoint}: {source}"))]
    ReadBody {
        stage: &'static str,
        endpoint: String,
        source: reqwest::Error,
    },
    #[snafu(display("response from {endpoint} is not JSON: {source}"))]
    DecodePayload {
        stage: &'static str,
        endpoint: String,
        source: serde_json::Error,
    },
    #[snafu(display("prompt list has an unrecognized shape: {details}"))]
    UnrecognizedShape {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("prompt {prompt_id} does not exist"))]
    PromptNotFound {
        stage: &'static str,
        prompt_id: String,
    },
    #[snafu(display("assistant directory request failed on `{stage}`: {source}"))]
    Provider {
        stage: &'static str,
        source: ProviderError,
    },
}

impl CatalogError {
    pub fn is_network_unavailable(&self) -> bool {
        match self {
            Self::NetworkUnavailable { .. } => true,
            Self::Provider { source, .. } => source.is_network_unavailable(),
            _ => false,
        }
    }
}

pub type CatalogResult<T> = Result<T, CatalogError>;
