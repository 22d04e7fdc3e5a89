use std::sync::Arc;
use std::time::Duration;

use snafu::ResultExt;
use storefront_llm::{AssistantResponder, BoxFuture, Model, default_openai_models};
use storefront_storage::KeyValueStore;

use super::cache::{CachePolicy, Catalog, CatalogOrigin, ReadThroughCache};
use super::error::{CatalogResult, ProviderSnafu};

pub const MODELS_KEY: &str = "storefront.catalog.models";

/// Model lists change rarely.
pub const DEFAULT_MODEL_TTL: Duration = Duration::from_secs(60 * 60);

struct RemoteModels {
    responder: Arc<AssistantResponder>,
}

impl RemoteModels {
    async fn fetch_models(&self) -> CatalogResult<Vec<Model>> {
        let Some(client) = self.responder.client() else {
            return Ok(Vec::new());
        };
        client.list_models().await.context(ProviderSnafu {
            stage: "list-models",
        })
    }
}

impl CatalogOrigin<Model> for RemoteModels {
    fn is_configured(&self) -> bool {
        self.responder.has_remote_client()
    }

    fn fetch(&self) -> BoxFuture<'_, CatalogResult<Vec<Model>>> {
        Box::pin(self.fetch_models())
    }
}

/// Provider model list, saved in the store like the other catalogs.
pub struct ModelDirectory {
    cache: ReadThroughCache<Model>,
}

impl ModelDirectory {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        responder: Arc<AssistantResponder>,
        policy: CachePolicy,
    ) -> Self {
        let origin = Arc::new(RemoteModels { responder });
        Self {
            cache: ReadThroughCache::new(store, MODELS_KEY, policy, origin, default_openai_models),
        }
    }

    pub async fn list(&self, force_refresh: bool) -> CatalogResult<Catalog<Model>> {
        self.cache.list(force_refresh).await
    }

    /// Drops the saved list; the next `list` asks the provider again.
    pub fn invalidate(&self) {
        self.cache.invalidate();
    }
}
