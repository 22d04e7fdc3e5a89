use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use storefront_llm::{AssistantResponder, AssistantsClient, ProviderError, create_client};
use storefront_storage::{JsonStoreExt, KeyValueStore, MemoryStore, SqliteStore, StorageError};
use tokio::task::JoinHandle;

use crate::catalog::{
    AssistantDirectory, CatalogError, ModelDirectory, PromptCatalog, PromptWebhookClient,
};
use crate::chat::{StreamingDispatcher, ThreadRepository};
use crate::settings::{StoreLocation, StorefrontSettings};

/// Credential entered at runtime; wins over the configured one.
pub const RUNTIME_API_KEY_KEY: &str = "storefront.settings.openai_api_key";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("failed to open the store at {location} on `{stage}`: {source}"))]
    OpenStore {
        stage: &'static str,
        location: String,
        source: StorageError,
    },
    #[snafu(display("failed to build the assistants client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("failed to build the prompt webhook client on `{stage}`: {source}"))]
    BuildWebhooks {
        stage: &'static str,
        source: CatalogError,
    },
    #[snafu(display("failed to save the API key on `{stage}`: {source}"))]
    PersistCredential {
        stage: &'static str,
        source: StorageError,
    },
}

pub type AppResult<T> = Result<T, AppError>;

/// Everything the storefront needs, wired over one store.
pub struct Storefront {
    settings: Arc<StorefrontSettings>,
    store: Arc<dyn KeyValueStore>,
    responder: Arc<AssistantResponder>,
    threads: Arc<ThreadRepository>,
    prompts: PromptCatalog,
    assistants: AssistantDirectory,
    models: ModelDirectory,
    store_watcher: JoinHandle<()>,
}

impl Storefront {
    /// Opens the configured store and wires the services over it.
    pub async fn open(settings: StorefrontSettings) -> AppResult<Self> {
        let store: Arc<dyn KeyValueStore> = match settings.store_location() {
            StoreLocation::Memory => Arc::new(MemoryStore::new()),
            StoreLocation::Sqlite(path) => {
                let location = path.to_string_lossy().into_owned();
                let store = SqliteStore::open(&location).await.context(OpenStoreSnafu {
                    stage: "open-sqlite-store",
                    location: location.clone(),
                })?;
                tracing::info!(location = %location, "opened sqlite store");
                Arc::new(store)
            }
        };
        Self::new(settings, store)
    }

    /// Wires the services over an already open store. Must run inside a Tokio runtime; the
    /// thread repository starts following the store's change feed.
    pub fn new(settings: StorefrontSettings, store: Arc<dyn KeyValueStore>) -> AppResult<Self> {
        let settings = Arc::new(settings.normalized());

        let client = runtime_api_key(store.as_ref())
            .and_then(|api_key| startup_client(&settings, &api_key, "saved"))
            .or_else(|| startup_client(&settings, &settings.openai_api_key, "configured"));
        tracing::info!(remote = client.is_some(), "assistant responder ready");
        let responder = Arc::new(AssistantResponder::new(client));

        let threads = Arc::new(ThreadRepository::new(
            store.clone(),
            responder.clone(),
            StreamingDispatcher::new(settings.stream_delay()),
        ));
        let store_watcher = threads.watch_store();

        let webhooks = PromptWebhookClient::new(settings.prompt_webhooks()).context(
            BuildWebhooksSnafu {
                stage: "build-prompt-webhooks",
            },
        )?;
        let prompts = PromptCatalog::new(store.clone(), webhooks, settings.prompt_cache_policy());
        let assistants = AssistantDirectory::new(
            store.clone(),
            responder.clone(),
            settings.assistant_cache_policy(),
        );
        let models = ModelDirectory::new(
            store.clone(),
            responder.clone(),
            settings.model_cache_policy(),
        );

        Ok(Self {
            settings,
            store,
            responder,
            threads,
            prompts,
            assistants,
            models,
            store_watcher,
        })
    }

    /// Normalized settings the services were built from.
    pub fn settings(&self) -> &StorefrontSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Thread repository; also the entry point for sending messages.
    pub fn threads(&self) -> &Arc<ThreadRepository> {
        &self.threads
    }

    pub fn prompts(&self) -> &PromptCatalog {
        &self.prompts
    }

    pub fn assistants(&self) -> &AssistantDirectory {
        &self.assistants
    }

    /// Provider models, or the built-in list without a credential.
    pub fn models(&self) -> &ModelDirectory {
        &self.models
    }

    pub fn responder(&self) -> &Arc<AssistantResponder> {
        &self.responder
    }

    pub fn has_remote_assistants(&self) -> bool {
        self.responder.has_remote_client()
    }

    /// Saves a credential entered at runtime and swaps it into the responder.
    /// A blank key drops back to canned replies. Returns whether a remote client is active.
    /// A key the client rejects is neither saved nor swapped in.
    pub fn set_api_key(&self, api_key: &str) -> AppResult<bool> {
        let api_key = api_key.trim();
        let client = match self.settings.provider_config(api_key) {
            Some(config) => create_client(config).context(BuildClientSnafu {
                stage: "swap-assistants-client",
            })?,
            None => None,
        };

        let persisted = if api_key.is_empty() {
            self.store.remove(RUNTIME_API_KEY_KEY)
        } else {
            self.store.save_json(RUNTIME_API_KEY_KEY, api_key)
        };
        persisted.context(PersistCredentialSnafu {
            stage: "save-runtime-api-key",
        })?;

        let remote = client.is_some();
        self.responder.set_client(client);
        // Saved lists belong to the previous credential.
        self.assistants.invalidate();
        self.models.invalidate();

        tracing::info!(remote, "updated API key");
        Ok(remote)
    }
}

// A key the client cannot use is skipped so startup still reaches canned replies.
fn startup_client(
    settings: &StorefrontSettings,
    api_key: &str,
    origin: &'static str,
) -> Option<AssistantsClient> {
    let config = settings.provider_config(api_key)?;
    match create_client(config) {
        Ok(client) => client,
        Err(error) => {
            tracing::warn!(origin, error = %error, "ignoring unusable API key");
            None
        }
    }
}

impl Drop for Storefront {
    fn drop(&mut self) {
        self.store_watcher.abort();
    }
}

fn runtime_api_key(store: &dyn KeyValueStore) -> Option<String> {
    match store.load_json::<String>(RUNTIME_API_KEY_KEY) {
        Ok(key) => key.map(|key| key.trim().to_string()).filter(|key| !key.is_empty()),
        Err(error) => {
            tracing::warn!(error = %error, "stored API key unreadable; ignoring it");
            None
        }
    }
}
