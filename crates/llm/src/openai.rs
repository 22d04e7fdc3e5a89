use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use snafu::{ResultExt, ensure};

use super::model::{Model, normalize_models};
use super::provider::{
    BuildHttpClientSnafu, DecodePayloadSnafu, HttpStatusSnafu, InvalidApiKeySnafu,
    MissingApiKeySnafu, MissingAssistantReplySnafu, ModelPayloadParseSnafu, ProviderConfig,
    ProviderError, ProviderResult, ReadBodySnafu, RunFailedSnafu,
};

/// Beta header every Assistants API request must carry.
pub const ASSISTANTS_BETA_HEADER: &str = "openai-beta";
pub const ASSISTANTS_BETA_VERSION: &str = "assistants=v2";

const PENDING_RUN_STATUSES: &[&str] = &["queued", "in_progress", "cancelling"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteThread {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteRun {
    pub id: String,
    pub status: String,
}

impl RemoteRun {
    pub fn is_pending(&self) -> bool {
        PENDING_RUN_STATUSES.contains(&self.status.as_str())
    }

    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteMessage {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub content: Vec<RemoteContentPart>,
}

impl RemoteMessage {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                RemoteContentPart::Text { text } => Some(text.value.as_str()),
                RemoteContentPart::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteContentPart {
    Text { text: RemoteText },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteText {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAssistant {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListEnvelope<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct RemoteModel {
    id: String,
    #[serde(default)]
    owned_by: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Thin client over the Assistants API endpoints the storefront consumes.
#[derive(Clone)]
pub struct AssistantsClient {
    http: reqwest::Client,
    config: ProviderConfig,
}

impl std::fmt::Debug for AssistantsClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AssistantsClient")
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

impl AssistantsClient {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "assistants-client-new",
            }
        );

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key)).context(
            InvalidApiKeySnafu {
                stage: "assistants-client-auth-header",
            },
        )?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            ASSISTANTS_BETA_HEADER,
            HeaderValue::from_static(ASSISTANTS_BETA_VERSION),
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context(BuildHttpClientSnafu {
                stage: "assistants-client-build",
            })?;

        Ok(Self {
            http,
            config,
        })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    pub async fn create_thread(&self) -> ProviderResult<RemoteThread> {
        let endpoint = self.url("/threads");
        send_json(
            "create-remote-thread",
            &endpoint,
            self.http.post(&endpoint).json(&json!({})),
        )
        .await
    }

    pub async fn post_user_message(
        &self,
        thread_id: &str,
        content: &str,
    ) -> ProviderResult<RemoteMessage> {
        let endpoint = self.url(&format!("/threads/{thread_id}/messages"));
        send_json(
            "post-remote-message",
            &endpoint,
            self.http
                .post(&endpoint)
                .json(&json!({ "role": "user", "content": content })),
        )
        .await
    }

    pub async fn create_run(&self, thread_id: &str, assistant_id: &str) -> ProviderResult<RemoteRun> {
        let endpoint = self.url(&format!("/threads/{thread_id}/runs"));
        send_json(
            "create-remote-run",
            &endpoint,
            self.http
                .post(&endpoint)
                .json(&json!({ "assistant_id": assistant_id })),
        )
        .await
    }

    pub async fn get_run(&self, thread_id: &str, run_id: &str) -> ProviderResult<RemoteRun> {
        let endpoint = self.url(&format!("/threads/{thread_id}/runs/{run_id}"));
        send_json("get-remote-run", &endpoint, self.http.get(&endpoint)).await
    }

    pub async fn list_messages(&self, thread_id: &str) -> ProviderResult<Vec<RemoteMessage>> {
        let endpoint = self.url(&format!("/threads/{thread_id}/messages"));
        let envelope: ListEnvelope<RemoteMessage> = send_json(
            "list-remote-messages",
            &endpoint,
            self.http
                .get(&endpoint)
                .query(&[("order", "desc"), ("limit", "20")]),
        )
        .await?;
        Ok(envelope.data)
    }

    pub async fn list_assistants(&self) -> ProviderResult<Vec<RemoteAssistant>> {
        let endpoint = self.url("/assistants");
        let envelope: ListEnvelope<RemoteAssistant> = send_json(
            "list-remote-assistants",
            &endpoint,
            self.http
                .get(&endpoint)
                .query(&[("order", "desc"), ("limit", "100")]),
        )
        .await?;
        Ok(envelope.data)
    }

    pub async fn list_models(&self) -> ProviderResult<Vec<Model>> {
        let endpoint = self.url("/models");
        let envelope: ListEnvelope<RemoteModel> =
            send_json("list-remote-models", &endpoint, self.http.get(&endpoint)).await?;

        let models = normalize_models(envelope.data.into_iter().map(|remote| {
            let model = Model::from_id(remote.id);
            match remote.owned_by {
                Some(owner) => model.with_owner(owner),
                None => model,
            }
        }));

        if models.is_empty() {
            return ModelPayloadParseSnafu {
                stage: "parse-model-response",
                details: "no model identifiers found in provider response".to_string(),
            }
            .fail();
        }

        Ok(models)
    }

    /// Runs one user turn against a remote assistant and returns its reply text.
    ///
    /// Each call uses a fresh remote thread. Polling is bounded by the configured
    /// run timeout.
    pub async fn complete_with_assistant(
        &self,
        assistant_id: &str,
        user_text: &str,
    ) -> ProviderResult<String> {
        let thread = self.create_thread().await?;
        self.post_user_message(&thread.id, user_text).await?;
        let run = self.create_run(&thread.id, assistant_id).await?;

        tracing::debug!(
            assistant_id,
            remote_thread_id = %thread.id,
            run_id = %run.id,
            "remote run started"
        );

        let run_id = run.id.clone();
        let timeout = self.config.run_timeout;
        let finished = match tokio::time::timeout(timeout, self.wait_for_run(&thread.id, run))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProviderError::RunTimedOut {
                    stage: "poll-remote-run",
                    run_id,
                    waited: timeout,
                });
            }
        };

        ensure!(
            finished.is_completed(),
            RunFailedSnafu {
                stage: "poll-remote-run",
                run_id: finished.id.clone(),
                status: finished.status.clone(),
            }
        );

        let messages = self.list_messages(&thread.id).await?;
        let reply = messages
            .iter()
            .find(|message| message.role == "assistant")
            .map(RemoteMessage::text)
            .filter(|text| !text.trim().is_empty());

        match reply {
            Some(text) => Ok(text),
            None => MissingAssistantReplySnafu {
                stage: "read-remote-reply",
                thread_id: thread.id,
            }
            .fail(),
        }
    }

    async fn wait_for_run(&self, thread_id: &str, mut run: RemoteRun) -> ProviderResult<RemoteRun> {
        while run.is_pending() {
            tokio::time::sleep(self.config.run_poll_interval).await;
            run = self.get_run(thread_id, &run.id).await?;
            tracing::trace!(run_id = %run.id, status = %run.status, "polled remote run");
        }
        Ok(run)
    }
}

async fn send_json<T>(
    stage: &'static str,
    endpoint: &str,
    request: reqwest::RequestBuilder,
) -> ProviderResult<T>
where
    T: DeserializeOwned,
{
    let response = request
        .send()
        .await
        .map_err(|source| ProviderError::NetworkUnavailable {
            stage,
            endpoint: endpoint.to_string(),
            source,
        })?;

    let status = response.status();
    let body = response.text().await.context(ReadBodySnafu { stage })?;

    if !status.is_success() {
        return HttpStatusSnafu {
            stage,
            status: status.as_u16(),
            message: error_message_from_body(&body)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
        }
        .fail();
    }

    serde_json::from_str(&body).context(DecodePayloadSnafu { stage })
}

fn error_message_from_body(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .map(|envelope| envelope.error.message)
        .filter(|message| !message.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client_for(server: &MockServer) -> AssistantsClient {
        let config = ProviderConfig::new("sk-test", server.uri())
            .with_run_poll_interval(Duration::from_millis(5))
            .with_run_timeout(Duration::from_secs(5));
        AssistantsClient::new(config).expect("client")
    }

    async fn mount_run_flow(server: &MockServer, final_status: &str) {
        Mock::given(method("POST"))
            .and(path("/threads"))
            .and(header("OpenAI-Beta", "assistants=v2"))
            .and(header("Authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "thread_1"})))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/threads/thread_1/messages"))
            .and(body_json(json!({"role": "user", "content": "hi"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_user",
                "role": "user",
                "content": [{"type": "text", "text": {"value": "hi"}}]
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/threads/thread_1/runs"))
            .and(body_json(json!({"assistant_id": "asst_42"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "run_1", "status": "queued"})),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/threads/thread_1/runs/run_1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "run_1", "status": final_status})),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/threads/thread_1/messages"))
            .and(query_param("order", "desc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {
                        "id": "msg_reply",
                        "role": "assistant",
                        "content": [
                            {"type": "image_file", "image_file": {"file_id": "f"}},
                            {"type": "text", "text": {"value": "Hello from the remote assistant"}}
                        ]
                    },
                    {
                        "id": "msg_user",
                        "role": "user",
                        "content": [{"type": "text", "text": {"value": "hi"}}]
                    }
                ]
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn completed_run_returns_latest_assistant_text() {
        let server = MockServer::start().await;
        mount_run_flow(&server, "completed").await;

        let reply = client_for(&server)
            .complete_with_assistant("asst_42", "hi")
            .await
            .expect("remote reply");

        assert_eq!(reply, "Hello from the remote assistant");
    }

    #[tokio::test]
    async fn unsuccessful_terminal_status_is_reported() {
        let server = MockServer::start().await;
        mount_run_flow(&server, "failed").await;

        let error = client_for(&server)
            .complete_with_assistant("asst_42", "hi")
            .await
            .expect_err("failed run must error");

        assert!(
            matches!(error, ProviderError::RunFailed { ref status, .. } if status == "failed"),
            "unexpected error: {error}"
        );
    }

    #[tokio::test]
    async fn stuck_run_times_out() {
        let server = MockServer::start().await;
        mount_run_flow(&server, "in_progress").await;

        let config = ProviderConfig::new("sk-test", server.uri())
            .with_run_poll_interval(Duration::from_millis(5))
            .with_run_timeout(Duration::from_millis(60));
        let client = AssistantsClient::new(config).expect("client");

        let error = client
            .complete_with_assistant("asst_42", "hi")
            .await
            .expect_err("stuck run must time out");

        assert!(matches!(error, ProviderError::RunTimedOut { .. }));
    }

    #[tokio::test]
    async fn error_body_message_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/assistants"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "Incorrect API key provided", "type": "invalid_request_error"}
            })))
            .mount(&server)
            .await;

        let error = client_for(&server)
            .list_assistants()
            .await
            .expect_err("401 must error");

        assert_eq!(error.status(), Some(401));
        assert_eq!(error.to_string(), "Incorrect API key provided");
    }

    #[tokio::test]
    async fn status_without_error_body_uses_generic_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let error = client_for(&server)
            .list_models()
            .await
            .expect_err("503 must error");

        assert_eq!(error.to_string(), "HTTP 503");
    }

    #[tokio::test]
    async fn unreachable_host_is_a_network_limitation() {
        // Nothing listens on the discard port.
        let config = ProviderConfig::new("sk-test", "http://127.0.0.1:9");
        let client = AssistantsClient::new(config).expect("client");

        let error = client.list_assistants().await.expect_err("must fail");

        assert!(error.is_network_unavailable());
        assert!(error.to_string().contains("CORS or network limitation"));
    }

    #[tokio::test]
    async fn model_list_is_sorted_with_owners() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"id": "gpt-4o-mini", "owned_by": "system"},
                    {"id": "gpt-4o", "owned_by": "openai"},
                    {"id": " "}
                ]
            })))
            .mount(&server)
            .await;

        let models = client_for(&server).list_models().await.expect("models");

        assert_eq!(
            models,
            vec![
                Model::from_id("gpt-4o").with_owner("openai"),
                Model::from_id("gpt-4o-mini").with_owner("system"),
            ]
        );
    }

    #[tokio::test]
    async fn empty_model_list_is_a_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .mount(&server)
            .await;

        let error = client_for(&server).list_models().await.expect_err("no models");
        assert!(matches!(error, ProviderError::ModelPayloadParse { .. }));
    }

    #[test]
    fn blank_api_key_is_rejected() {
        let error = AssistantsClient::new(ProviderConfig::new("  ", ""))
            .expect_err("blank key must be rejected");
        assert!(matches!(error, ProviderError::MissingApiKey { .. }));
    }

    #[test]
    fn control_characters_in_the_key_are_rejected() {
        let error = AssistantsClient::new(ProviderConfig::new("sk-a\u{1}b", ""))
            .expect_err("key with a control character");
        assert!(matches!(error, ProviderError::InvalidApiKey { .. }));
    }
}
