//! OpenAI-compatible chat-completions client.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use relingo_content::{normalize_response, plain_text, slugify};
use relingo_shared::{ArticleMetadata, RelingoError, Stage, TransformConfig};

use crate::prompts::{metadata_prompt, stage_prompt};
use crate::{TransformError, TransformService};

const USER_AGENT: &str = concat!("relingo/", env!("CARGO_PKG_VERSION"));

/// [`TransformService`] backed by a `/chat/completions` endpoint.
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    endpoint: String,
    model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

impl OpenAiClient {
    pub fn new(config: &TransformConfig) -> relingo_shared::Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RelingoError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
        })
    }

    /// Send one user message and return the completion text.
    async fn chat(&self, prompt: &str, json_output: bool) -> Result<String, TransformError> {
        let request = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            response_format: json_output.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| TransformError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransformError::Transient(format!("failed to read body: {e}")))?;

        if !status.is_success() {
            let err = classify(status, &body);
            warn!(status = status.as_u16(), code = err.code(), "transform request failed");
            return Err(err);
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| TransformError::Transient(format!("unparsable response: {e}")))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| TransformError::Transient("response has no choices".into()))?;

        // Output cut off at the token limit: the same input will be cut off again.
        if choice.finish_reason.as_deref() == Some("length") {
            return Err(TransformError::ContextTooLarge(
                "completion truncated at the output token limit".into(),
            ));
        }

        let content = choice.message.content.unwrap_or_default();
        if content.trim().is_empty() {
            return Err(TransformError::Transient("empty completion".into()));
        }

        debug!(chars = content.len(), "completion received");
        Ok(content)
    }
}

#[async_trait]
impl TransformService for OpenAiClient {
    async fn transform(
        &self,
        stage: Stage,
        content: &str,
        target_language: Option<&str>,
    ) -> Result<String, TransformError> {
        let prompt = stage_prompt(stage, content, target_language)?;
        self.chat(&prompt, false).await
    }

    async fn extract_metadata(
        &self,
        content: &str,
        target_language: &str,
    ) -> Result<ArticleMetadata, TransformError> {
        let prompt = metadata_prompt(&plain_text(content), target_language);
        let raw = self.chat(&prompt, true).await?;
        parse_metadata(&raw)
    }
}

/// Map a non-success HTTP response onto the failure taxonomy.
pub(crate) fn classify(status: StatusCode, body: &str) -> TransformError {
    let api = serde_json::from_str::<ErrorEnvelope>(body).ok().map(|e| e.error);
    let code = api
        .as_ref()
        .and_then(|e| e.code.as_ref())
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    let message = api.as_ref().map(|e| e.message.as_str()).unwrap_or_default();
    let detail = if message.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {message}")
    };

    if status == StatusCode::TOO_MANY_REQUESTS || code == "rate_limit_exceeded" {
        TransformError::RateLimited(detail)
    } else if status == StatusCode::PAYLOAD_TOO_LARGE
        || code == "context_length_exceeded"
        || message.contains("maximum context length")
    {
        TransformError::ContextTooLarge(detail)
    } else if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || status.is_server_error()
    {
        // Expired or rotated credentials.
        TransformError::Transient(detail)
    } else if status.is_client_error() {
        TransformError::InvalidRequest(detail)
    } else {
        TransformError::Transient(detail)
    }
}

fn parse_metadata(raw: &str) -> Result<ArticleMetadata, TransformError> {
    let mut meta: ArticleMetadata = serde_json::from_str(&normalize_response(raw))
        .map_err(|e| TransformError::InvalidRequest(format!("metadata is not valid JSON: {e}")))?;

    meta.title = meta.title.trim().to_string();
    if meta.title.is_empty() {
        return Err(TransformError::InvalidRequest("metadata has an empty title".into()));
    }
    meta.description = meta.description.trim().to_string();
    meta.slug = slugify(if meta.slug.trim().is_empty() {
        &meta.title
    } else {
        &meta.slug
    });
    Ok(meta)
}
