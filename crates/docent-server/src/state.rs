use std::sync::Arc;

use docent_core::{GenerationConfig, GeneratorFactory, UserKnowledgeConfidence};
use docent_feedback::FeedbackAggregator;

/// Shared application state accessible from all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub feedback: FeedbackAggregator,
    pub generators: Arc<GeneratorFactory>,
    /// Per-user domain confidence, fed by questions and reactions.
    pub confidence: Arc<UserKnowledgeConfidence>,
    /// Defaults applied to `/api/ask` requests.
    pub generation: GenerationConfig,
    /// Window used when a feedback query omits `days`.
    pub default_days: u32,
}

#[cfg(test)]
impl AppState {
    pub(crate) fn for_tests() -> Self {
        use docent_core::{GeneratorConfig, TemplateRegistry};
        use docent_feedback::FeedbackStore;
        use docent_provider::{BackendConfig, BackendRegistry, BackendType};

        let generators = GeneratorFactory::new(
            Arc::new(BackendRegistry::new()),
            Arc::new(TemplateRegistry::new()),
            GeneratorConfig::new("stub")
                .with_backend_config(BackendConfig::new("stub", BackendType::Stub)),
        );
        let store = FeedbackStore::open_in_memory().expect("open in-memory feedback store");
        Self {
            feedback: FeedbackAggregator::new(store),
            generators: Arc::new(generators),
            confidence: Arc::new(UserKnowledgeConfidence::new()),
            generation: GenerationConfig::default(),
            default_days: 30,
        }
    }
}
