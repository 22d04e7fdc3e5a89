mod assistant;
mod canned;
mod model;
mod openai;
mod provider;
mod responder;

pub use assistant::{AssistantKind, REMOTE_ASSISTANT_PREFIX};
pub use canned::CannedResponses;
pub use model::{DEFAULT_OPENAI_MODEL, Model, default_openai_models, normalize_models};
pub use openai::{
    ASSISTANTS_BETA_HEADER, ASSISTANTS_BETA_VERSION, AssistantsClient, RemoteAssistant,
    RemoteContentPart, RemoteMessage, RemoteRun, RemoteText, RemoteThread,
};
pub use provider::{
    BoxFuture, DEFAULT_BASE_URL, DEFAULT_RUN_POLL_INTERVAL, DEFAULT_RUN_TIMEOUT, ProviderConfig,
    ProviderError, ProviderResult,
};
pub use responder::{AssistantResponder, GenerateRequest, ResponseGenerator};

/// Builds a client when a credential is configured; a blank key means canned replies only.
pub fn create_client(config: ProviderConfig) -> ProviderResult<Option<AssistantsClient>> {
    if config.api_key.trim().is_empty() {
        return Ok(None);
    }

    AssistantsClient::new(config).map(Some)
}
