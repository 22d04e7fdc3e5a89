use std::sync::Arc;

use arc_swap::ArcSwapOption;

use super::assistant::AssistantKind;
use super::canned::CannedResponses;
use super::openai::AssistantsClient;
use super::provider::{BoxFuture, ProviderResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateRequest {
    pub user_text: String,
    pub assistant: AssistantKind,
    pub assistant_name: String,
}

impl GenerateRequest {
    pub fn new(
        user_text: impl Into<String>,
        assistant: AssistantKind,
        assistant_name: impl Into<String>,
    ) -> Self {
        Self {
            user_text: user_text.into(),
            assistant,
            assistant_name: assistant_name.into(),
        }
    }
}

/// Produces the complete assistant reply for one user turn.
pub trait ResponseGenerator: Send + Sync {
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'_, ProviderResult<String>>;
}

/// Remote assistant when possible, canned reply otherwise.
///
/// The client slot can be swapped at runtime when the user supplies a credential.
pub struct AssistantResponder {
    client: ArcSwapOption<AssistantsClient>,
    canned: CannedResponses,
}

impl Default for AssistantResponder {
    fn default() -> Self {
        Self::new(None)
    }
}

impl AssistantResponder {
    pub fn new(client: Option<AssistantsClient>) -> Self {
        Self {
            client: ArcSwapOption::from(client.map(Arc::new)),
            canned: CannedResponses::new(),
        }
    }

    pub fn set_client(&self, client: Option<AssistantsClient>) {
        self.client.store(client.map(Arc::new));
    }

    pub fn client(&self) -> Option<Arc<AssistantsClient>> {
        self.client.load_full()
    }

    pub fn has_remote_client(&self) -> bool {
        self.client.load().is_some()
    }

    pub fn canned(&self) -> &CannedResponses {
        &self.canned
    }

    async fn respond(&self, request: GenerateRequest) -> ProviderResult<String> {
        if let (Some(client), Some(assistant_id)) =
            (self.client.load_full(), request.assistant.remote_id())
        {
            match client
                .complete_with_assistant(assistant_id, &request.user_text)
                .await
            {
                Ok(reply) => return Ok(reply.trim().to_string()),
                Err(error) => {
                    tracing::warn!(
                        assistant_id,
                        error = %error,
                        "remote assistant failed; falling back to canned reply"
                    );
                }
            }
        }

        Ok(self
            .canned
            .reply(&request.user_text, &request.assistant_name))
    }
}

impl ResponseGenerator for AssistantResponder {
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'_, ProviderResult<String>> {
        Box::pin(self.respond(request))
    }
}
