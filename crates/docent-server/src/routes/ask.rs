use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use docent_core::{FactoryError, GenerationOptions, GenerationResult};
use serde::Deserialize;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub query: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub use_rag: Option<bool>,
    /// Generator type: `default`, `rag` or `chat`.
    #[serde(default)]
    pub generator: Option<String>,
    #[serde(default)]
    pub template_type: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Asking user; with `domain`, lowers that user's confidence in it.
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(ask))
}

async fn ask(
    State(state): State<AppState>,
    Json(req): Json<AskRequest>,
) -> Result<Json<GenerationResult>, StatusCode> {
    if req.query.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let generator_type = req
        .generator
        .clone()
        .unwrap_or_else(|| state.generation.default_generator.as_str().to_string());
    let generator = state
        .generators
        .get_generator(&generator_type, None)
        .map_err(|e| match e {
            FactoryError::UnknownType(_) => StatusCode::BAD_REQUEST,
            FactoryError::Backend(e) => {
                tracing::error!("failed to create backend: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })?;

    let options = GenerationOptions {
        template_type: req.template_type,
        max_tokens: Some(req.max_tokens.unwrap_or(state.generation.max_tokens)),
        max_context_chunks: Some(state.generation.max_context_chunks),
        ..GenerationOptions::default()
    };
    let use_rag = req.use_rag.unwrap_or(state.generation.use_rag);

    if let (Some(user_id), Some(domain)) = (req.user_id.as_deref(), req.domain.as_deref()) {
        let confidence = state.confidence.record_question(user_id, domain);
        tracing::debug!(user_id, domain, confidence, "recorded question");
    }

    generator
        .generate_response(&req.query, None, req.conversation_id.as_deref(), use_rag, &options)
        .await
        .map(Json)
        .map_err(|e| {
            tracing::warn!("ask failed: {e}");
            StatusCode::BAD_GATEWAY
        })
}
