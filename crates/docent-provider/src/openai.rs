use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{BackendError, ChatMessage, LlmBackend};

const BACKEND_NAME: &str = "openai";

/// OpenAI-compatible chat-completions and embeddings client.
#[derive(Debug, Clone)]
pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
    chat_model: String,
    embedding_model: Option<String>,
}

impl OpenAiBackend {
    pub fn new(
        api_key: impl Into<String>,
        api_base: impl Into<String>,
        chat_model: impl Into<String>,
    ) -> Self {
        Self {
            client: build_client(Duration::from_secs(60)),
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            chat_model: chat_model.into(),
            embedding_model: None,
        }
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = build_client(timeout);
        self
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    async fn generate_completion(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
    ) -> Result<String, BackendError> {
        let url = format!("{}/chat/completions", self.api_base);
        let payload = ApiChatRequest {
            model: Some(self.chat_model.clone()),
            messages: messages.to_vec(),
            max_tokens: Some(max_tokens),
        };
        let req = self
            .client
            .post(url)
            .header("authorization", format!("Bearer {}", self.api_key))
            .json(&payload);

        let body: ApiChatResponse = send_json(BACKEND_NAME, req).await?;
        completion_text(BACKEND_NAME, body)
    }

    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        let model = self
            .embedding_model
            .clone()
            .ok_or_else(|| BackendError::Unsupported {
                backend: BACKEND_NAME.to_string(),
                capability: "embeddings without an embedding_model",
            })?;
        let url = format!("{}/embeddings", self.api_base);
        let payload = ApiEmbeddingRequest {
            model: Some(model),
            input: text.to_string(),
        };
        let req = self
            .client
            .post(url)
            .header("authorization", format!("Bearer {}", self.api_key))
            .json(&payload);

        let body: ApiEmbeddingResponse = send_json(BACKEND_NAME, req).await?;
        first_embedding(BACKEND_NAME, body)
    }
}

pub(crate) fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

/// Send a JSON request and decode a JSON body, turning non-200 replies into
/// [`BackendError::Api`].
pub(crate) async fn send_json<R: DeserializeOwned>(
    backend: &str,
    req: reqwest::RequestBuilder,
) -> Result<R, BackendError> {
    let resp = req
        .send()
        .await
        .map_err(|e| BackendError::from_reqwest(backend, e))?;

    let status = resp.status();
    if status != StatusCode::OK {
        let text = resp.text().await.unwrap_or_default();
        return Err(format_api_error(backend, status, &text));
    }

    resp.json::<R>()
        .await
        .map_err(|e| BackendError::from_reqwest(backend, e))
}

pub(crate) fn format_api_error(backend: &str, status: StatusCode, body: &str) -> BackendError {
    let message = serde_json::from_str::<ApiErrorEnvelope>(body)
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|_| {
            status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string()
        });
    BackendError::Api {
        backend: backend.to_string(),
        status: status.as_u16(),
        message,
    }
}

pub(crate) fn completion_text(
    backend: &str,
    body: ApiChatResponse,
) -> Result<String, BackendError> {
    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| BackendError::InvalidResponse {
            backend: backend.to_string(),
            message: "empty choices".into(),
        })?;
    if let Some(usage) = body.usage {
        tracing::debug!(
            backend,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "completion usage"
        );
    }
    Ok(choice.message.content.unwrap_or_default())
}

pub(crate) fn first_embedding(
    backend: &str,
    body: ApiEmbeddingResponse,
) -> Result<Vec<f32>, BackendError> {
    body.data
        .into_iter()
        .min_by_key(|item| item.index)
        .map(|item| item.embedding)
        .ok_or_else(|| BackendError::InvalidResponse {
            backend: backend.to_string(),
            message: "empty embedding data".into(),
        })
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ApiChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiChatResponse {
    pub choices: Vec<ApiChoice>,
    #[serde(default)]
    pub usage: Option<ApiUsage>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiChoice {
    pub message: ApiResponseMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ApiEmbeddingRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub input: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiEmbeddingResponse {
    pub data: Vec<ApiEmbeddingItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiEmbeddingItem {
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub index: usize,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_trailing_slash() {
        let backend = OpenAiBackend::new("k", "https://api.openai.com/v1/", "gpt-4o");
        assert_eq!(backend.api_base, "https://api.openai.com/v1");
    }

    #[test]
    fn format_api_error_uses_envelope_message() {
        let err = format_api_error(
            "openai",
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"error":{"message":"slow down","type":"rate_limit"}}"#,
        );
        assert_eq!(err.to_string(), "openai api error (429): slow down");
        assert!(err.is_retryable());
    }

    #[test]
    fn format_api_error_falls_back_to_reason() {
        let err = format_api_error("openai", StatusCode::BAD_GATEWAY, "<html>");
        assert_eq!(err.to_string(), "openai api error (502): Bad Gateway");
    }

    #[test]
    fn chat_request_preserves_message_order() {
        let payload = ApiChatRequest {
            model: Some("gpt-4o".into()),
            messages: vec![ChatMessage::system("sys"), ChatMessage::user("hi")],
            max_tokens: Some(10),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
    }

    #[test]
    fn completion_text_rejects_empty_choices() {
        let body = ApiChatResponse {
            choices: vec![],
            usage: None,
        };
        assert!(matches!(
            completion_text("openai", body),
            Err(BackendError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn first_embedding_picks_lowest_index() {
        let body = ApiEmbeddingResponse {
            data: vec![
                ApiEmbeddingItem {
                    embedding: vec![2.0],
                    index: 1,
                },
                ApiEmbeddingItem {
                    embedding: vec![1.0],
                    index: 0,
                },
            ],
        };
        assert_eq!(first_embedding("openai", body).unwrap(), vec![1.0]);
    }

    #[tokio::test]
    async fn embedding_without_model_is_unsupported() {
        let backend = OpenAiBackend::new("k", "http://localhost:1", "gpt-4o");
        let err = backend.generate_embedding("text").await.unwrap_err();
        assert!(matches!(err, BackendError::Unsupported { .. }));
    }
}
