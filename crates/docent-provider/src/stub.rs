use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::{BackendError, ChatMessage, LlmBackend};

pub const STUB_EMBEDDING_DIMS: usize = 64;

/// Offline backend: echoes the last user message and embeds text as a hashed
/// bag of words, so retrieval ranking still behaves sensibly without network.
#[derive(Debug, Clone)]
pub struct StubBackend {
    model: String,
}

impl StubBackend {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new("stub")
    }
}

#[async_trait]
impl LlmBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    async fn generate_completion(
        &self,
        messages: &[ChatMessage],
        _max_tokens: u32,
    ) -> Result<String, BackendError> {
        let user_text = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        Ok(format!("[stub:{}] {}", self.model, user_text))
    }

    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        Ok(hashed_embedding(text))
    }
}

fn hashed_embedding(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0_f32; STUB_EMBEDDING_DIMS];
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let digest = Sha256::digest(token.to_lowercase().as_bytes());
        let slot = usize::from(digest[0]) % STUB_EMBEDDING_DIMS;
        vector[slot] += 1.0;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}
