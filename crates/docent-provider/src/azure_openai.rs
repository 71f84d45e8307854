use std::time::Duration;

use async_trait::async_trait;

use crate::openai::{
    build_client, completion_text, first_embedding, send_json, ApiChatRequest,
    ApiChatResponse, ApiEmbeddingRequest, ApiEmbeddingResponse,
};
use crate::{BackendError, ChatMessage, LlmBackend};

const BACKEND_NAME: &str = "azure_openai";
pub const DEFAULT_API_VERSION: &str = "2024-02-01";

/// Azure OpenAI deployment-scoped client.
///
/// Azure addresses models by deployment name in the path and versions the API
/// through the `api-version` query parameter; the key goes in `api-key`.
#[derive(Debug, Clone)]
pub struct AzureOpenAiBackend {
    client: reqwest::Client,
    pub(crate) api_key: String,
    pub(crate) endpoint: String,
    pub(crate) chat_deployment: String,
    pub(crate) embedding_deployment: Option<String>,
    pub(crate) api_version: String,
}

impl AzureOpenAiBackend {
    pub fn new(
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        chat_deployment: impl Into<String>,
    ) -> Self {
        Self {
            client: build_client(Duration::from_secs(120)),
            api_key: api_key.into(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            chat_deployment: chat_deployment.into(),
            embedding_deployment: None,
            api_version: DEFAULT_API_VERSION.to_string(),
        }
    }

    pub fn with_embedding_deployment(mut self, deployment: impl Into<String>) -> Self {
        self.embedding_deployment = Some(deployment.into());
        self
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = build_client(timeout);
        self
    }

    fn deployment_url(&self, deployment: &str, operation: &str) -> String {
        format!(
            "{}/openai/deployments/{}/{}",
            self.endpoint, deployment, operation
        )
    }
}

#[async_trait]
impl LlmBackend for AzureOpenAiBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    async fn generate_completion(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
    ) -> Result<String, BackendError> {
        let url = self.deployment_url(&self.chat_deployment, "chat/completions");
        let payload = ApiChatRequest {
            model: None,
            messages: messages.to_vec(),
            max_tokens: Some(max_tokens),
        };
        let req = self
            .client
            .post(url)
            .query(&[("api-version", self.api_version.as_str())])
            .header("api-key", &self.api_key)
            .json(&payload);

        let body: ApiChatResponse = send_json(BACKEND_NAME, req).await?;
        completion_text(BACKEND_NAME, body)
    }

    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        let deployment =
            self.embedding_deployment
                .as_deref()
                .ok_or_else(|| BackendError::Unsupported {
                    backend: BACKEND_NAME.to_string(),
                    capability: "embeddings without an embedding deployment",
                })?;
        let url = self.deployment_url(deployment, "embeddings");
        let payload = ApiEmbeddingRequest {
            model: None,
            input: text.to_string(),
        };
        let req = self
            .client
            .post(url)
            .query(&[("api-version", self.api_version.as_str())])
            .header("api-key", &self.api_key)
            .json(&payload);

        let body: ApiEmbeddingResponse = send_json(BACKEND_NAME, req).await?;
        first_embedding(BACKEND_NAME, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn azure_backend_constructs_correctly() {
        let backend = AzureOpenAiBackend::new(
            "test-key",
            "https://myresource.openai.azure.com/",
            "gpt-4o",
        );
        assert_eq!(backend.endpoint, "https://myresource.openai.azure.com");
        assert_eq!(backend.api_key, "test-key");
        assert_eq!(backend.api_version, DEFAULT_API_VERSION);
    }

    #[test]
    fn deployment_url_is_scoped_to_deployment() {
        let backend = AzureOpenAiBackend::new("k", "https://r.openai.azure.com", "chat-dep")
            .with_embedding_deployment("embed-dep");
        assert_eq!(
            backend.deployment_url("chat-dep", "chat/completions"),
            "https://r.openai.azure.com/openai/deployments/chat-dep/chat/completions"
        );
        assert_eq!(backend.embedding_deployment.as_deref(), Some("embed-dep"));
    }
}
