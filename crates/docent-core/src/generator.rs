use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use docent_memory::ConversationHistory;
use docent_provider::{BackendError, ChatMessage, LlmBackend};
use docent_schema::MessageRole;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retriever::{render_context, ContextChunk, ContextRetriever, RetrievalError};
use crate::templates::{
    FormattedPrompt, FormattingError, PromptTemplate, TemplateRegistry, DEFAULT_TEMPLATE,
    RAG_TEMPLATE,
};

pub const DEFAULT_MAX_TOKENS: u32 = 1000;
pub const DEFAULT_MAX_CONTEXT_CHUNKS: usize = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GenerationOptions {
    /// Overrides the path's default template (`rag` or `default`).
    #[serde(default)]
    pub template_type: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub max_context_chunks: Option<usize>,
    /// Values for caller-defined template placeholders.
    #[serde(default)]
    pub extra_params: HashMap<String, String>,
}

impl GenerationOptions {
    pub fn with_template(mut self, template_type: impl Into<String>) -> Self {
        self.template_type = Some(template_type.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    fn max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }

    fn template_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.template_type.as_deref().unwrap_or(fallback)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationResult {
    pub response_text: String,
    pub template_type: String,
    pub used_rag: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_chunks: Option<Vec<ContextChunk>>,
}

/// Terminal failure of a generation request.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Formatting(#[from] FormattingError),
    #[error("generation failed: {0}")]
    Backend(#[from] BackendError),
}

#[derive(Debug, Error)]
enum RagError {
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    #[error(transparent)]
    Formatting(#[from] FormattingError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// The generation pipeline contract.
///
/// `generate_with_rag` never fails outward on retrieval, formatting or
/// backend errors; it degrades to `generate_direct`, whose own failure is
/// terminal.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate_response(
        &self,
        query: &str,
        context: Option<&str>,
        conversation_id: Option<&str>,
        use_rag: bool,
        options: &GenerationOptions,
    ) -> Result<GenerationResult, GenerationError> {
        if use_rag {
            let max_chunks = options
                .max_context_chunks
                .unwrap_or(DEFAULT_MAX_CONTEXT_CHUNKS);
            self.generate_with_rag(query, conversation_id, max_chunks, options)
                .await
        } else {
            self.generate_direct(query, context, conversation_id, options)
                .await
        }
    }

    async fn generate_with_rag(
        &self,
        query: &str,
        conversation_id: Option<&str>,
        max_context_chunks: usize,
        options: &GenerationOptions,
    ) -> Result<GenerationResult, GenerationError>;

    async fn generate_direct(
        &self,
        query: &str,
        context: Option<&str>,
        conversation_id: Option<&str>,
        options: &GenerationOptions,
    ) -> Result<GenerationResult, GenerationError>;

    /// Empty when no retriever is configured or it fails.
    async fn retrieve_context(&self, query: &str, max_chunks: usize) -> Vec<ContextChunk>;

    fn prompt_template(&self, template_type: &str) -> Arc<PromptTemplate>;

    fn format_prompt(
        &self,
        template_type: &str,
        context: &str,
        query: &str,
        extra: &HashMap<String, String>,
    ) -> Result<FormattedPrompt, FormattingError>;
}

/// The concrete generator behind every factory type.
pub struct ResponsePipeline {
    backend: Arc<dyn LlmBackend>,
    templates: Arc<TemplateRegistry>,
    retriever: Option<Arc<dyn ContextRetriever>>,
    history: Option<Arc<dyn ConversationHistory>>,
}

impl ResponsePipeline {
    pub fn new(backend: Arc<dyn LlmBackend>, templates: Arc<TemplateRegistry>) -> Self {
        Self {
            backend,
            templates,
            retriever: None,
            history: None,
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn ContextRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_history(mut self, history: Arc<dyn ConversationHistory>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn has_retriever(&self) -> bool {
        self.retriever.is_some()
    }

    pub fn has_history(&self) -> bool {
        self.history.is_some()
    }

    async fn complete(
        &self,
        prompt: &FormattedPrompt,
        options: &GenerationOptions,
    ) -> Result<String, BackendError> {
        let messages = [
            ChatMessage::system(prompt.system.clone()),
            ChatMessage::user(prompt.user.clone()),
        ];
        self.backend
            .generate_completion(&messages, options.max_tokens())
            .await
    }

    async fn try_rag(
        &self,
        retriever: &dyn ContextRetriever,
        query: &str,
        max_context_chunks: usize,
        options: &GenerationOptions,
    ) -> Result<(FormattedPrompt, Vec<ContextChunk>, String), RagError> {
        let chunks = retriever.retrieve_context(query, max_context_chunks).await?;
        let context = render_context(&chunks);
        let prompt = self.templates.format(
            options.template_or(RAG_TEMPLATE),
            &context,
            query,
            &options.extra_params,
        )?;
        let response = self.complete(&prompt, options).await?;
        Ok((prompt, chunks, response))
    }

    /// Append the user and assistant turns. Failures are logged only.
    async fn record_turns(
        &self,
        conversation_id: Option<&str>,
        query: &str,
        result: &GenerationResult,
    ) {
        let (Some(history), Some(conversation_id)) = (&self.history, conversation_id) else {
            return;
        };

        if let Err(e) = history
            .add_message(conversation_id, query, MessageRole::User, None)
            .await
        {
            tracing::warn!(conversation_id, "failed to record user turn: {e}");
        }

        let metadata = serde_json::json!({
            "template_type": result.template_type,
            "used_rag": result.used_rag,
        });
        if let Err(e) = history
            .add_message(
                conversation_id,
                &result.response_text,
                MessageRole::Assistant,
                Some(metadata),
            )
            .await
        {
            tracing::warn!(conversation_id, "failed to record assistant turn: {e}");
        }
    }
}

#[async_trait]
impl ResponseGenerator for ResponsePipeline {
    async fn generate_with_rag(
        &self,
        query: &str,
        conversation_id: Option<&str>,
        max_context_chunks: usize,
        options: &GenerationOptions,
    ) -> Result<GenerationResult, GenerationError> {
        let Some(retriever) = &self.retriever else {
            tracing::debug!("no context retriever configured, generating directly");
            return self
                .generate_direct(query, None, conversation_id, options)
                .await;
        };

        match self
            .try_rag(retriever.as_ref(), query, max_context_chunks, options)
            .await
        {
            Ok((prompt, chunks, response_text)) => {
                let result = GenerationResult {
                    response_text,
                    template_type: prompt.template,
                    used_rag: true,
                    context_chunks: Some(chunks),
                };
                self.record_turns(conversation_id, query, &result).await;
                Ok(result)
            }
            Err(e) => {
                tracing::warn!("RAG generation failed, falling back to direct: {e}");
                self.generate_direct(query, None, conversation_id, options)
                    .await
            }
        }
    }

    async fn generate_direct(
        &self,
        query: &str,
        context: Option<&str>,
        conversation_id: Option<&str>,
        options: &GenerationOptions,
    ) -> Result<GenerationResult, GenerationError> {
        let prompt = self.templates.format(
            options.template_or(DEFAULT_TEMPLATE),
            context.unwrap_or_default(),
            query,
            &options.extra_params,
        )?;
        let response_text = self.complete(&prompt, options).await.map_err(|e| {
            tracing::error!("direct generation failed: {e}");
            GenerationError::Backend(e)
        })?;

        let result = GenerationResult {
            response_text,
            template_type: prompt.template,
            used_rag: false,
            context_chunks: None,
        };
        self.record_turns(conversation_id, query, &result).await;
        Ok(result)
    }

    async fn retrieve_context(&self, query: &str, max_chunks: usize) -> Vec<ContextChunk> {
        let Some(retriever) = &self.retriever else {
            return Vec::new();
        };
        match retriever.retrieve_context(query, max_chunks).await {
            Ok(chunks) => chunks,
            Err(e) => {
                tracing::warn!("context retrieval failed: {e}");
                Vec::new()
            }
        }
    }

    fn prompt_template(&self, template_type: &str) -> Arc<PromptTemplate> {
        self.templates.get(template_type)
    }

    fn format_prompt(
        &self,
        template_type: &str,
        context: &str,
        query: &str,
        extra: &HashMap<String, String>,
    ) -> Result<FormattedPrompt, FormattingError> {
        self.templates.format(template_type, context, query, extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docent_provider::StubBackend;

    fn pipeline() -> ResponsePipeline {
        ResponsePipeline::new(
            Arc::new(StubBackend::new("m")),
            Arc::new(TemplateRegistry::new()),
        )
    }

    #[tokio::test]
    async fn direct_uses_default_template() {
        let result = pipeline()
            .generate_direct("hello", None, None, &GenerationOptions::default())
            .await
            .unwrap();
        assert_eq!(result.template_type, "default");
        assert!(!result.used_rag);
        assert!(result.context_chunks.is_none());
        assert!(result.response_text.ends_with("Question: hello"));
    }

    #[tokio::test]
    async fn direct_passes_caller_context() {
        let result = pipeline()
            .generate_direct("q", Some("given ctx"), None, &GenerationOptions::default())
            .await
            .unwrap();
        assert!(result.response_text.contains("given ctx"));
    }

    #[tokio::test]
    async fn rag_without_retriever_degrades_to_direct() {
        let p = pipeline();
        let options = GenerationOptions::default();
        let rag = p.generate_with_rag("q", None, 3, &options).await.unwrap();
        let direct = p.generate_direct("q", None, None, &options).await.unwrap();
        assert_eq!(rag, direct);
    }

    #[tokio::test]
    async fn generate_response_dispatches_on_flag() {
        let p = pipeline();
        let options = GenerationOptions::default().with_template("chat");
        let result = p
            .generate_response("q", None, None, false, &options)
            .await
            .unwrap();
        assert_eq!(result.template_type, "chat");
    }

    #[tokio::test]
    async fn retrieve_context_without_retriever_is_empty() {
        assert!(pipeline().retrieve_context("q", 3).await.is_empty());
    }

    #[tokio::test]
    async fn missing_extra_param_is_terminal_in_direct() {
        let mut templates = TemplateRegistry::new();
        templates
            .register(PromptTemplate::new("team", "Team {team}", "{query}"))
            .unwrap();
        let p = ResponsePipeline::new(Arc::new(StubBackend::default()), Arc::new(templates));
        let err = p
            .generate_direct("q", None, None, &GenerationOptions::default().with_template("team"))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Formatting(_)));
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: GenerationOptions = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(options.max_tokens(), DEFAULT_MAX_TOKENS);
        assert_eq!(options.template_or("rag"), "rag");
    }
}
