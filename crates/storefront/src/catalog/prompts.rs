use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::{OptionExt, ResultExt};
use storefront_llm::BoxFuture;
use storefront_storage::KeyValueStore;
use uuid::Uuid;

use super::cache::{CachePolicy, Catalog, CatalogOrigin, ReadThroughCache};
use super::error::{
    BuildHttpClientSnafu, CatalogError, CatalogResult, DecodePayloadSnafu, HttpStatusSnafu,
    PromptNotFoundSnafu, ReadBodySnafu, UnrecognizedShapeSnafu,
};

pub const PROMPTS_KEY: &str = "storefront.catalog.prompts";

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Reusable prompt template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    /// Backends hand out numeric ids too; they are kept as strings.
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(alias = "name")]
    pub title: String,
    #[serde(alias = "prompt", alias = "text")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "tag_list")]
    pub tags: Vec<String>,
    #[serde(default, alias = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, alias = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Fields a caller supplies when creating a prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PromptDraft {
    pub title: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub tags: Vec<String>,
}

impl PromptDraft {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            ..Self::default()
        }
    }

    fn into_prompt(self, id: String) -> Prompt {
        let now = Utc::now().to_rfc3339();
        Prompt {
            id,
            title: self.title,
            content: self.content,
            description: self.description,
            category: self.category,
            tags: self.tags,
            created_at: Some(now.clone()),
            updated_at: Some(now),
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(text) => text,
        RawId::Number(number) => number.to_string(),
    })
}

// Tags arrive either as a list or as one comma separated string.
fn tag_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTags {
        List(Vec<String>),
        Joined(String),
        Missing(()),
    }

    Ok(match RawTags::deserialize(deserializer)? {
        RawTags::List(tags) => tags,
        RawTags::Joined(joined) => joined
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect(),
        RawTags::Missing(()) => Vec::new(),
    })
}

/// Accepted shapes of a prompt-list response, tried in declaration order.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PromptListPayload {
    Bare(Vec<Prompt>),
    Wrapped { prompts: Vec<Prompt> },
    Data { data: Vec<Prompt> },
    Single(Box<Prompt>),
    Object(Map<String, Value>),
}

impl PromptListPayload {
    fn into_prompts(self, stage: &'static str) -> CatalogResult<Vec<Prompt>> {
        match self {
            Self::Bare(prompts) | Self::Wrapped { prompts } | Self::Data { data: prompts } => {
                Ok(prompts)
            }
            Self::Single(prompt) => Ok(vec![*prompt]),
            Self::Object(object) => object
                .into_iter()
                .filter(|(_, value)| value.is_array())
                .find_map(|(_, value)| serde_json::from_value::<Vec<Prompt>>(value).ok())
                .context(UnrecognizedShapeSnafu {
                    stage,
                    details: "object without any array of prompts",
                }),
        }
    }
}

/// Decodes any accepted prompt-list shape.
pub fn decode_prompt_list(body: &str) -> CatalogResult<Vec<Prompt>> {
    let stage = "decode-prompt-list";
    let value: Value = serde_json::from_str(body).context(DecodePayloadSnafu {
        stage,
        endpoint: "prompt webhook",
    })?;

    match serde_json::from_value::<PromptListPayload>(value) {
        Ok(payload) => payload.into_prompts(stage),
        Err(_) => UnrecognizedShapeSnafu {
            stage,
            details: "expected an array or an object of prompts",
        }
        .fail(),
    }
}

/// The four independently configured prompt webhooks. Unset entries are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptWebhooks {
    pub get_url: Option<String>,
    pub create_url: Option<String>,
    pub update_url: Option<String>,
    pub delete_url: Option<String>,
}

impl PromptWebhooks {
    pub fn new(
        get_url: Option<String>,
        create_url: Option<String>,
        update_url: Option<String>,
        delete_url: Option<String>,
    ) -> Self {
        Self {
            get_url: non_blank(get_url),
            create_url: non_blank(create_url),
            update_url: non_blank(update_url),
            delete_url: non_blank(delete_url),
        }
    }
}

fn non_blank(url: Option<String>) -> Option<String> {
    url.map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
}

/// HTTP client for the prompt webhooks.
pub struct PromptWebhookClient {
    http: reqwest::Client,
    webhooks: PromptWebhooks,
}

impl PromptWebhookClient {
    pub fn new(webhooks: PromptWebhooks) -> CatalogResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .context(BuildHttpClientSnafu {
                stage: "build-webhook-client",
            })?;
        Ok(Self { http, webhooks })
    }

    pub fn webhooks(&self) -> &PromptWebhooks {
        &self.webhooks
    }

    pub async fn fetch_prompts(&self) -> CatalogResult<Vec<Prompt>> {
        let stage = "fetch-prompts";
        let Some(url) = self.webhooks.get_url.as_deref() else {
            return Ok(Vec::new());
        };
        let body = send(stage, url, self.http.get(url)).await?;
        decode_prompt_list(&body)
    }

    /// Returns the backend's copy of the prompt when the response carries one.
    pub async fn create_prompt(&self, url: &str, draft: &PromptDraft) -> CatalogResult<Option<Prompt>> {
        let body = send("create-prompt", url, self.http.post(url).json(draft)).await?;
        Ok(first_prompt(&body))
    }

    pub async fn update_prompt(&self, url: &str, prompt: &Prompt) -> CatalogResult<Option<Prompt>> {
        let body = send("update-prompt", url, self.http.post(url).json(prompt)).await?;
        Ok(first_prompt(&body))
    }

    pub async fn delete_prompt(&self, url: &str, prompt_id: &str) -> CatalogResult<()> {
        send(
            "delete-prompt",
            url,
            self.http.post(url).json(&serde_json::json!({ "id": prompt_id })),
        )
        .await
        .map(|_| ())
    }
}

impl CatalogOrigin<Prompt> for PromptWebhookClient {
    fn is_configured(&self) -> bool {
        self.webhooks.get_url.is_some()
    }

    fn fetch(&self) -> BoxFuture<'_, CatalogResult<Vec<Prompt>>> {
        Box::pin(self.fetch_prompts())
    }
}

fn first_prompt(body: &str) -> Option<Prompt> {
    if body.trim().is_empty() {
        return None;
    }
    decode_prompt_list(body)
        .ok()
        .and_then(|prompts| prompts.into_iter().next())
}

async fn send(stage: &'static str, endpoint: &str, request: reqwest::RequestBuilder) -> CatalogResult<String> {
    let response = request
        .send()
        .await
        .map_err(|source| CatalogError::NetworkUnavailable {
            stage,
            endpoint: endpoint.to_string(),
            source,
        })?;

    let status = response.status();
    let body = response.text().await.context(ReadBodySnafu { stage, endpoint })?;

    if !status.is_success() {
        return HttpStatusSnafu {
            stage,
            endpoint,
            status: status.as_u16(),
            message: error_message(&body).unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
        }
        .fail();
    }
    Ok(body)
}

fn error_message(body: &str) -> Option<String> {
    let value = serde_json::from_str::<Value>(body).ok()?;
    let message = value
        .pointer("/error/message")
        .or_else(|| value.get("message"))
        .and_then(Value::as_str)?;
    let message = message.trim();
    (!message.is_empty()).then(|| message.to_string())
}

/// Prompt templates: read-through cached list plus create/update/delete.
///
/// Mutations go to the matching webhook when one is configured; without it they only
/// touch the saved list.
pub struct PromptCatalog {
    client: Arc<PromptWebhookClient>,
    cache: ReadThroughCache<Prompt>,
}

impl PromptCatalog {
    pub fn new(store: Arc<dyn KeyValueStore>, client: PromptWebhookClient, policy: CachePolicy) -> Self {
        let client = Arc::new(client);
        let cache = ReadThroughCache::new(store, PROMPTS_KEY, policy, client.clone(), default_prompts);
        Self { client, cache }
    }

    pub fn webhooks(&self) -> &PromptWebhooks {
        self.client.webhooks()
    }

    pub async fn list(&self, force_refresh: bool) -> CatalogResult<Catalog<Prompt>> {
        self.cache.list(force_refresh).await
    }

    pub async fn create(&self, draft: PromptDraft) -> CatalogResult<Prompt> {
        let prompt = match self.client.webhooks().create_url.clone() {
            Some(url) => {
                let returned = self.client.create_prompt(&url, &draft).await?;
                returned.unwrap_or_else(|| draft.into_prompt(new_prompt_id()))
            }
            None => draft.into_prompt(new_prompt_id()),
        };

        let mut prompts = self.cache.current_items();
        prompts.retain(|existing| existing.id != prompt.id);
        prompts.push(prompt.clone());
        self.cache.replace(prompts);
        tracing::info!(prompt_id = %prompt.id, "created prompt");
        Ok(prompt)
    }

    pub async fn update(&self, mut prompt: Prompt) -> CatalogResult<Prompt> {
        let mut prompts = self.cache.current_items();
        let index = prompts
            .iter()
            .position(|existing| existing.id == prompt.id)
            .context(PromptNotFoundSnafu {
                stage: "update-prompt",
                prompt_id: prompt.id.clone(),
            })?;

        prompt.updated_at = Some(Utc::now().to_rfc3339());
        if let Some(url) = self.client.webhooks().update_url.clone() {
            if let Some(returned) = self.client.update_prompt(&url, &prompt).await? {
                prompt = returned;
            }
        }

        prompts[index] = prompt.clone();
        self.cache.replace(prompts);
        tracing::info!(prompt_id = %prompt.id, "updated prompt");
        Ok(prompt)
    }

    pub async fn delete(&self, prompt_id: &str) -> CatalogResult<()> {
        let mut prompts = self.cache.current_items();
        let before = prompts.len();
        prompts.retain(|existing| existing.id != prompt_id);
        if prompts.len() == before {
            return PromptNotFoundSnafu {
                stage: "delete-prompt",
                prompt_id,
            }
            .fail();
        }

        if let Some(url) = self.client.webhooks().delete_url.clone() {
            self.client.delete_prompt(&url, prompt_id).await?;
        }

        self.cache.replace(prompts);
        tracing::info!(prompt_id, "deleted prompt");
        Ok(())
    }
}

fn new_prompt_id() -> String {
    Uuid::now_v7().to_string()
}

fn default_prompt(id: &str, title: &str, category: &str, content: &str) -> Prompt {
    Prompt {
        id: id.to_string(),
        title: title.to_string(),
        content: content.to_string(),
        description: None,
        category: Some(category.to_string()),
        tags: vec![category.to_lowercase()],
        created_at: None,
        updated_at: None,
    }
}

/// Built-in prompts shown when no saved or fetched list exists.
pub fn default_prompts() -> Vec<Prompt> {
    vec![
        default_prompt(
            "default-summarize",
            "Summarize a document",
            "Writing",
            "Summarize the following text in five bullet points, keeping names and numbers exact:\n\n",
        ),
        default_prompt(
            "default-email",
            "Draft a professional email",
            "Writing",
            "Write a short, friendly and professional email about the following topic:\n\n",
        ),
        default_prompt(
            "default-troubleshoot",
            "Troubleshoot an IT issue",
            "IT",
            "Help me troubleshoot this problem step by step. Ask for details when something is unclear:\n\n",
        ),
        default_prompt(
            "default-campaign",
            "Plan a marketing campaign",
            "Marketing",
            "Outline a campaign plan with audience, message, channels and success metrics for:\n\n",
        ),
    ]
}
