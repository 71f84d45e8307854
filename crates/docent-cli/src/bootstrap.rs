use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use docent_core::{
    load_config, DocentConfig, EmbeddingRetriever, GeneratorConfig, GeneratorFactory,
    UserKnowledgeConfidence,
};
use docent_feedback::{FeedbackAggregator, FeedbackStore};
use docent_memory::ConversationStore;
use docent_provider::BackendRegistry;
use docent_server::state::AppState;

/// Load `<root>/config/docent.yaml` and wire stores, backends and generators.
pub async fn bootstrap(root: &Path) -> Result<(DocentConfig, AppState)> {
    let config = load_config(&root.join("config"))?;

    let db_path = config.database_path(root);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let db_path = db_path
        .to_str()
        .ok_or_else(|| anyhow!("database path is not valid UTF-8: {}", db_path.display()))?;

    let conversations = Arc::new(ConversationStore::open(db_path)?);
    let feedback = FeedbackAggregator::new(FeedbackStore::open(db_path)?)
        .with_mirror(conversations.clone())
        .with_mirror_scan_limit(config.feedback.mirror_scan_limit);

    let backends = Arc::new(BackendRegistry::new());
    let backend = backends.get_or_create(&config.backend.id, &config.backend)?;

    let mut generator_config = GeneratorConfig::new(config.backend.id.clone())
        .with_backend_config(config.backend.clone())
        .with_conversation_service(conversations);

    if config.retrieval.enabled {
        if let Some(dir) = config.documents_dir(root) {
            let retriever = EmbeddingRetriever::new(backend, config.retrieval.chunker);
            let chunks = retriever
                .load_dir(&dir)
                .await
                .with_context(|| format!("failed to index {}", dir.display()))?;
            tracing::info!("indexed {chunks} chunks from {}", dir.display());
            generator_config = generator_config.with_context_service(Arc::new(retriever));
        }
    }

    let generators = GeneratorFactory::new(
        backends,
        Arc::new(config.template_registry()?),
        generator_config,
    );

    let state = AppState {
        feedback,
        generators: Arc::new(generators),
        confidence: Arc::new(UserKnowledgeConfidence::new()),
        generation: config.generation.clone(),
        default_days: config.feedback.default_days,
    };
    Ok((config, state))
}
