use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use storefront_llm::{AssistantKind, AssistantResponder, BoxFuture, RemoteAssistant};
use storefront_storage::KeyValueStore;

use super::cache::{CachePolicy, Catalog, CatalogOrigin, ReadThroughCache};
use super::error::{CatalogResult, ProviderSnafu};

pub const ASSISTANTS_KEY: &str = "storefront.catalog.assistants";

/// Younger directory entries are served without even a background refresh.
pub const ASSISTANT_REFRESH_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assistant {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub kind: AssistantKind,
}

impl Assistant {
    pub fn simulated(id: &str, name: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: Some(description.to_string()),
            model: None,
            instructions: None,
            kind: AssistantKind::classify(id, name),
        }
    }
}

impl From<RemoteAssistant> for Assistant {
    fn from(remote: RemoteAssistant) -> Self {
        let name = remote
            .name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| remote.id.clone());
        Self {
            kind: AssistantKind::classify(&remote.id, &name),
            id: remote.id,
            name,
            description: remote.description,
            model: remote.model,
            instructions: remote.instructions,
        }
    }
}

/// Built-in assistants answered from the canned bank.
pub fn default_assistants() -> Vec<Assistant> {
    vec![
        Assistant::simulated(
            "it-support",
            "IT Support",
            "Account access, VPN, printers, email and slow computers.",
        ),
        Assistant::simulated(
            "hr-assistant",
            "HR Assistant",
            "Leave, benefits, payroll and company policies.",
        ),
        Assistant::simulated(
            "sales-assistant",
            "Sales Assistant",
            "Pricing, quotes, demos and trials.",
        ),
        Assistant::simulated(
            "marketing-assistant",
            "Marketing Assistant",
            "Campaigns, copy and social media.",
        ),
    ]
}

// Reads the client slot on every fetch so a credential set at runtime is picked up.
struct RemoteAssistants {
    responder: Arc<AssistantResponder>,
}

impl RemoteAssistants {
    async fn fetch_assistants(&self) -> CatalogResult<Vec<Assistant>> {
        let Some(client) = self.responder.client() else {
            return Ok(Vec::new());
        };
        let remote = client.list_assistants().await.context(ProviderSnafu {
            stage: "list-assistants",
        })?;
        Ok(remote.into_iter().map(Assistant::from).collect())
    }
}

impl CatalogOrigin<Assistant> for RemoteAssistants {
    fn is_configured(&self) -> bool {
        self.responder.has_remote_client()
    }

    fn fetch(&self) -> BoxFuture<'_, CatalogResult<Vec<Assistant>>> {
        Box::pin(self.fetch_assistants())
    }
}

/// Assistant directory backed by the Assistants API list endpoint.
pub struct AssistantDirectory {
    cache: ReadThroughCache<Assistant>,
}

impl AssistantDirectory {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        responder: Arc<AssistantResponder>,
        policy: CachePolicy,
    ) -> Self {
        let origin = Arc::new(RemoteAssistants { responder });
        Self {
            cache: ReadThroughCache::new(store, ASSISTANTS_KEY, policy, origin, default_assistants),
        }
    }

    pub async fn list(&self, force_refresh: bool) -> CatalogResult<Catalog<Assistant>> {
        self.cache.list(force_refresh).await
    }

    /// Looks an assistant up in the last known list, by id or case-insensitive name.
    pub fn find(&self, id_or_name: &str) -> Option<Assistant> {
        let needle = id_or_name.trim();
        self.cache.current_items().into_iter().find(|assistant| {
            assistant.id == needle || assistant.name.eq_ignore_ascii_case(needle)
        })
    }

    /// Drops the saved list, e.g. after the credential changed.
    pub fn invalidate(&self) {
        self.cache.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use storefront_llm::{AssistantsClient, ProviderConfig};
    use storefront_storage::MemoryStore;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::catalog::cache::CatalogSource;
    use crate::catalog::error::CatalogError;

    fn policy() -> CachePolicy {
        CachePolicy::default().with_background_refresh(ASSISTANT_REFRESH_AFTER)
    }

    #[tokio::test]
    async fn without_credential_the_defaults_are_served() {
        let directory = AssistantDirectory::new(
            Arc::new(MemoryStore::new()),
            Arc::new(AssistantResponder::default()),
            policy(),
        );

        let catalog = directory.list(true).await.expect("defaults");
        assert_eq!(catalog.source, CatalogSource::StaticFallback);
        assert_eq!(catalog.items, default_assistants());
        assert!(catalog.items.iter().all(|assistant| !assistant.kind.is_remote()));
        assert_eq!(
            directory.find("it support").map(|assistant| assistant.id),
            Some("it-support".to_string())
        );
    }

    #[tokio::test]
    async fn remote_assistants_are_listed_once_within_the_window() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/assistants"))
            .and(header("openai-beta", "assistants=v2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "data": [
                    {"id": "asst_abc", "name": "Research Bot", "model": "gpt-4o"},
                    {"id": "asst_def", "name": null}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = AssistantsClient::new(ProviderConfig::new("sk-test", server.uri()))
            .expect("client");
        let directory = AssistantDirectory::new(
            Arc::new(MemoryStore::new()),
            Arc::new(AssistantResponder::new(Some(client))),
            policy(),
        );

        let first = directory.list(false).await.expect("first");
        let second = directory.list(false).await.expect("second");

        assert_eq!(first.source, CatalogSource::Origin);
        assert_eq!(second.source, CatalogSource::CacheFresh);
        assert_eq!(first.items, second.items);
        assert_eq!(first.items.len(), 2);
        assert_eq!(
            first.items[0].kind,
            AssistantKind::Remote("asst_abc".to_string())
        );
        assert_eq!(first.items[1].name, "asst_def");
    }

    #[tokio::test]
    async fn forced_refresh_reports_api_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/assistants"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "Incorrect API key provided"}
            })))
            .mount(&server)
            .await;

        let client = AssistantsClient::new(ProviderConfig::new("sk-bad", server.uri()))
            .expect("client");
        let directory = AssistantDirectory::new(
            Arc::new(MemoryStore::new()),
            Arc::new(AssistantResponder::new(Some(client))),
            policy(),
        );

        let fallback = directory.list(false).await.expect("fallback");
        assert_eq!(fallback.source, CatalogSource::StaticFallback);
        assert_eq!(fallback.warning.as_deref(), Some(
            "assistant directory request failed on `list-assistants`: Incorrect API key provided"
        ));

        let error = directory.list(true).await.expect_err("forced");
        assert!(matches!(error, CatalogError::Provider { .. }));
    }
}
