mod assistants;
mod cache;
mod error;
mod models;
mod prompts;

pub use assistants::{
    ASSISTANT_REFRESH_AFTER, ASSISTANTS_KEY, Assistant, AssistantDirectory, default_assistants,
};
pub use cache::{
    CachePolicy, CachedList, Catalog, CatalogOrigin, CatalogSource, DEFAULT_CATALOG_TTL,
    ReadThroughCache,
};
pub use error::{CatalogError, CatalogResult};
pub use models::{DEFAULT_MODEL_TTL, MODELS_KEY, ModelDirectory};
pub use prompts::{
    PROMPTS_KEY, Prompt, PromptCatalog, PromptDraft, PromptWebhookClient, PromptWebhooks,
    decode_prompt_list, default_prompts,
};
