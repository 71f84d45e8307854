use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use docent_memory::ConversationHistory;
use docent_provider::{BackendConfig, BackendError, BackendRegistry};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::generator::{ResponseGenerator, ResponsePipeline};
use crate::retriever::ContextRetriever;
use crate::templates::TemplateRegistry;

/// Generator variants. All build a [`ResponsePipeline`]; `rag` requires a
/// context service and `chat` a conversation service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorKind {
    #[default]
    Default,
    Rag,
    Chat,
}

impl GeneratorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Rag => "rag",
            Self::Chat => "chat",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, FactoryError> {
        match raw {
            "default" => Ok(Self::Default),
            "rag" => Ok(Self::Rag),
            "chat" => Ok(Self::Chat),
            other => Err(FactoryError::UnknownType(other.to_string())),
        }
    }
}

impl fmt::Display for GeneratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("unknown generator type: {0}")]
    UnknownType(String),
    #[error("failed to create backend: {0}")]
    Backend(#[from] BackendError),
}

/// Dependencies for building a generator.
#[derive(Clone, Default)]
pub struct GeneratorConfig {
    pub backend_client_type: String,
    pub backend_config: Option<BackendConfig>,
    pub context_service: Option<Arc<dyn ContextRetriever>>,
    pub conversation_service: Option<Arc<dyn ConversationHistory>>,
}

impl GeneratorConfig {
    pub fn new(backend_client_type: impl Into<String>) -> Self {
        Self {
            backend_client_type: backend_client_type.into(),
            ..Self::default()
        }
    }

    pub fn with_backend_config(mut self, config: BackendConfig) -> Self {
        self.backend_config = Some(config);
        self
    }

    pub fn with_context_service(mut self, retriever: Arc<dyn ContextRetriever>) -> Self {
        self.context_service = Some(retriever);
        self
    }

    pub fn with_conversation_service(mut self, history: Arc<dyn ConversationHistory>) -> Self {
        self.conversation_service = Some(history);
        self
    }
}

impl fmt::Debug for GeneratorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratorConfig")
            .field("backend_client_type", &self.backend_client_type)
            .field("backend_config", &self.backend_config)
            .field("context_service", &self.context_service.is_some())
            .field("conversation_service", &self.conversation_service.is_some())
            .finish()
    }
}

/// Builds and caches one generator per [`GeneratorKind`].
pub struct GeneratorFactory {
    backends: Arc<BackendRegistry>,
    templates: Arc<TemplateRegistry>,
    default_config: GeneratorConfig,
    generators: RwLock<HashMap<GeneratorKind, Arc<dyn ResponseGenerator>>>,
}

impl GeneratorFactory {
    pub fn new(
        backends: Arc<BackendRegistry>,
        templates: Arc<TemplateRegistry>,
        default_config: GeneratorConfig,
    ) -> Self {
        Self {
            backends,
            templates,
            default_config,
            generators: RwLock::new(HashMap::new()),
        }
    }

    pub fn templates(&self) -> Arc<TemplateRegistry> {
        Arc::clone(&self.templates)
    }

    /// Return the cached generator for `generator_type`, building it from
    /// `config` (or the factory default) on first use.
    pub fn get_generator(
        &self,
        generator_type: &str,
        config: Option<&GeneratorConfig>,
    ) -> Result<Arc<dyn ResponseGenerator>, FactoryError> {
        let kind = GeneratorKind::parse(generator_type)?;
        if let Some(existing) = self.cached(kind) {
            return Ok(existing);
        }

        let config = self.effective_config(kind, config);
        let generator = self.build(config)?;

        let mut generators = match self.generators.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = generators.entry(kind).or_insert_with(|| {
            tracing::info!(generator = %kind, "created response generator");
            generator
        });
        Ok(Arc::clone(entry))
    }

    /// Replace the cached generator for `generator_type`.
    pub fn register_generator(
        &self,
        generator_type: &str,
        generator: Arc<dyn ResponseGenerator>,
    ) -> Result<(), FactoryError> {
        let kind = GeneratorKind::parse(generator_type)?;
        let mut generators = match self.generators.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        generators.insert(kind, generator);
        tracing::info!(generator = %kind, "registered response generator override");
        Ok(())
    }

    fn cached(&self, kind: GeneratorKind) -> Option<Arc<dyn ResponseGenerator>> {
        let generators = match self.generators.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        generators.get(&kind).cloned()
    }

    fn effective_config<'a>(
        &'a self,
        kind: GeneratorKind,
        config: Option<&'a GeneratorConfig>,
    ) -> &'a GeneratorConfig {
        let Some(config) = config else {
            return &self.default_config;
        };
        match kind {
            GeneratorKind::Rag if config.context_service.is_none() => {
                tracing::warn!("rag generator requested without context_service, using default config");
                &self.default_config
            }
            GeneratorKind::Chat if config.conversation_service.is_none() => {
                tracing::warn!(
                    "chat generator requested without conversation_service, using default config"
                );
                &self.default_config
            }
            _ => config,
        }
    }

    fn build(&self, config: &GeneratorConfig) -> Result<Arc<dyn ResponseGenerator>, FactoryError> {
        let client_type = if config.backend_client_type.is_empty() {
            self.default_config.backend_client_type.as_str()
        } else {
            config.backend_client_type.as_str()
        };
        let backend_config = config
            .backend_config
            .clone()
            .or_else(|| self.default_config.backend_config.clone())
            .unwrap_or_else(|| BackendConfig {
                id: client_type.to_string(),
                ..BackendConfig::default()
            });
        let backend = self.backends.get_or_create(client_type, &backend_config)?;

        let mut pipeline = ResponsePipeline::new(backend, Arc::clone(&self.templates));
        if let Some(retriever) = &config.context_service {
            pipeline = pipeline.with_retriever(Arc::clone(retriever));
        }
        if let Some(history) = &config.conversation_service {
            pipeline = pipeline.with_history(Arc::clone(history));
        }
        Ok(Arc::new(pipeline))
    }
}
