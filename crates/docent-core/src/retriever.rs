use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use docent_provider::{BackendError, LlmBackend};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::chunker::{chunk_text, ChunkerConfig};

/// One retrieved snippet plus provenance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextChunk {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance_score: Option<f32>,
}

impl ContextChunk {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source: None,
            relevance_score: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_score(mut self, score: f32) -> Self {
        self.relevance_score = Some(score);
        self
    }
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("embedding failed: {0}")]
    Embedding(#[from] BackendError),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("retrieval failed: {0}")]
    Other(String),
}

/// Source of ranked context for a query. Ordering of the returned chunks is
/// the retriever's relevance order.
#[async_trait]
pub trait ContextRetriever: Send + Sync {
    async fn retrieve_context(
        &self,
        query: &str,
        max_chunks: usize,
    ) -> Result<Vec<ContextChunk>, RetrievalError>;
}

/// Render chunks as numbered passages:
/// `[i] {content}\nSource: {source}\n\n`, concatenated and trimmed.
pub fn render_context(chunks: &[ContextChunk]) -> String {
    let mut out = String::new();
    for (i, chunk) in chunks.iter().enumerate() {
        out.push_str(&format!("[{}] {}\n", i + 1, chunk.content));
        if let Some(source) = &chunk.source {
            out.push_str(&format!("Source: {source}\n"));
        }
        out.push('\n');
    }
    out.trim().to_string()
}

#[derive(Debug, Clone)]
struct IndexedChunk {
    content: String,
    source: String,
    embedding: Vec<f32>,
}

/// In-memory vector index over document chunks, embedded through the
/// backend gateway and ranked by cosine similarity.
pub struct EmbeddingRetriever {
    backend: Arc<dyn LlmBackend>,
    chunker: ChunkerConfig,
    entries: RwLock<Vec<IndexedChunk>>,
}

impl EmbeddingRetriever {
    pub fn new(backend: Arc<dyn LlmBackend>, chunker: ChunkerConfig) -> Self {
        Self {
            backend,
            chunker,
            entries: RwLock::new(Vec::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Chunk, embed and index one document. Returns the number of chunks added.
    pub async fn add_document(&self, source: &str, text: &str) -> Result<usize, RetrievalError> {
        let mut indexed = Vec::new();
        for content in chunk_text(text, &self.chunker) {
            let embedding = self.backend.generate_embedding(&content).await?;
            indexed.push(IndexedChunk {
                content,
                source: source.to_string(),
                embedding,
            });
        }
        let added = indexed.len();
        self.entries.write().await.extend(indexed);
        tracing::debug!(source, chunks = added, "indexed document");
        Ok(added)
    }

    /// Index every `.md`/`.txt` file under `dir`, recursively. Sources are
    /// recorded relative to `dir`.
    pub async fn load_dir(&self, dir: &Path) -> Result<usize, RetrievalError> {
        let mut pending = vec![dir.to_path_buf()];
        let mut files = Vec::new();
        while let Some(current) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&current)
                .await
                .map_err(|source| RetrievalError::Io {
                    path: current.clone(),
                    source,
                })?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|source| RetrievalError::Io {
                    path: current.clone(),
                    source,
                })?
            {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if is_document(&path) {
                    files.push(path);
                }
            }
        }
        files.sort();

        let mut total = 0;
        for path in files {
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| RetrievalError::Io {
                    path: path.clone(),
                    source,
                })?;
            let source = path
                .strip_prefix(dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            total += self.add_document(&source, &text).await?;
        }
        tracing::info!(dir = %dir.display(), chunks = total, "document index loaded");
        Ok(total)
    }
}

#[async_trait]
impl ContextRetriever for EmbeddingRetriever {
    async fn retrieve_context(
        &self,
        query: &str,
        max_chunks: usize,
    ) -> Result<Vec<ContextChunk>, RetrievalError> {
        if max_chunks == 0 {
            return Ok(Vec::new());
        }
        let query_embedding = self.backend.generate_embedding(query).await?;
        let entries = self.entries.read().await;

        let mut scored: Vec<(f32, &IndexedChunk)> = entries
            .iter()
            .map(|entry| (cosine_similarity(&query_embedding, &entry.embedding), entry))
            .filter(|(score, _)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(max_chunks);

        Ok(scored
            .into_iter()
            .map(|(score, entry)| {
                ContextChunk::new(entry.content.clone())
                    .with_source(entry.source.clone())
                    .with_score(score)
            })
            .collect())
    }
}

fn is_document(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("md") | Some("markdown") | Some("txt")
    )
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }

    let score = dot / (norm_a.sqrt() * norm_b.sqrt());
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use docent_provider::StubBackend;

    #[test]
    fn render_single_chunk_with_source() {
        let chunks = vec![ContextChunk::new("Paris is the capital").with_source("doc1")];
        assert_eq!(render_context(&chunks), "[1] Paris is the capital\nSource: doc1");
    }

    #[test]
    fn render_numbers_in_order_and_omits_missing_source() {
        let chunks = vec![
            ContextChunk::new("first").with_source("a.md"),
            ContextChunk::new("second"),
            ContextChunk::new("third").with_source("c.md"),
        ];
        assert_eq!(
            render_context(&chunks),
            "[1] first\nSource: a.md\n\n[2] second\n\n[3] third\nSource: c.md"
        );
    }

    #[test]
    fn render_empty_is_empty() {
        assert_eq!(render_context(&[]), "");
    }

    #[test]
    fn cosine_similarity_identical() {
        let a = vec![1.0_f32, 2.0, 3.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn retrieves_most_similar_document_first() {
        let retriever =
            EmbeddingRetriever::new(Arc::new(StubBackend::default()), ChunkerConfig::default());
        retriever
            .add_document("france.md", "Paris is the capital of France")
            .await
            .unwrap();
        retriever
            .add_document("rust.md", "Cargo builds crates and manages dependencies")
            .await
            .unwrap();

        let chunks = retriever
            .retrieve_context("what is the capital of France", 1)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].source.as_deref(), Some("france.md"));
        assert!(chunks[0].relevance_score.unwrap() > 0.0);
    }

    #[tokio::test]
    async fn load_dir_indexes_markdown_and_text_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("guide.md"), "Deploys run nightly").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("faq.txt"), "Ask in #help").unwrap();
        std::fs::write(dir.path().join("image.png"), [0u8, 1, 2]).unwrap();

        let retriever =
            EmbeddingRetriever::new(Arc::new(StubBackend::default()), ChunkerConfig::default());
        let added = retriever.load_dir(dir.path()).await.unwrap();
        assert_eq!(added, 2);
        assert_eq!(retriever.len().await, 2);
    }

    #[tokio::test]
    async fn load_dir_missing_is_io_error() {
        let retriever =
            EmbeddingRetriever::new(Arc::new(StubBackend::default()), ChunkerConfig::default());
        let err = retriever
            .load_dir(Path::new("/definitely/not/here"))
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::Io { .. }));
    }

    #[tokio::test]
    async fn zero_max_chunks_returns_nothing() {
        let retriever =
            EmbeddingRetriever::new(Arc::new(StubBackend::default()), ChunkerConfig::default());
        retriever.add_document("a", "text").await.unwrap();
        assert!(retriever.retrieve_context("text", 0).await.unwrap().is_empty());
    }
}
