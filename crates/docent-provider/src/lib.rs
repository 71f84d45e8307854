pub mod azure_openai;
pub mod error;
pub mod openai;
pub mod retry;
pub mod stub;
pub mod types;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use azure_openai::AzureOpenAiBackend;
pub use error::BackendError;
pub use openai::OpenAiBackend;
pub use retry::{RetryPolicy, RetryingBackend};
pub use stub::StubBackend;
pub use types::ChatMessage;

/// Capability set of a language-model backend.
///
/// `messages` is ordered (system first, then user/assistant turns) and is
/// forwarded in that order. Transport failures surface as [`BackendError`].
#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn generate_completion(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
    ) -> Result<String, BackendError>;

    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, BackendError>;
}

// ============================================================
// Backend Configuration
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    AzureOpenai,
    Openai,
    #[default]
    Stub,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AzureOpenai => "azure_openai",
            Self::Openai => "openai",
            Self::Stub => "stub",
        }
    }
}

fn default_backend_id() -> String {
    "default".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

/// Configuration for one backend client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Client-type key the instance is cached under.
    #[serde(default = "default_backend_id")]
    pub id: String,
    #[serde(rename = "type", default)]
    pub backend_type: BackendType,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the API key, used when `api_key` is unset.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Azure resource endpoint or OpenAI-compatible base URL.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Model name (OpenAI) or deployment name (Azure) for completions.
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            id: default_backend_id(),
            backend_type: BackendType::default(),
            api_key: None,
            api_key_env: None,
            base_url: None,
            chat_model: default_chat_model(),
            embedding_model: None,
            api_version: None,
            retry: RetryPolicy::default(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl BackendConfig {
    pub fn new(id: impl Into<String>, backend_type: BackendType) -> Self {
        Self {
            id: id.into(),
            backend_type,
            ..Self::default()
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = Some(model.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Inline key first, then the named environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Some(key.clone());
        }
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|k| !k.is_empty())
    }
}

/// Build a backend from configuration. Network adapters come wrapped in a
/// [`RetryingBackend`].
pub fn create_backend(config: &BackendConfig) -> Result<Arc<dyn LlmBackend>, BackendError> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let backend: Arc<dyn LlmBackend> = match config.backend_type {
        BackendType::AzureOpenai => {
            let key = config.resolve_api_key().ok_or_else(|| {
                BackendError::Config(format!("backend {} requires an api key", config.id))
            })?;
            let endpoint = config.base_url.as_deref().ok_or_else(|| {
                BackendError::Config(format!("backend {} requires base_url", config.id))
            })?;
            let mut azure = AzureOpenAiBackend::new(key, endpoint, config.chat_model.clone())
                .with_timeout(timeout);
            if let Some(deployment) = &config.embedding_model {
                azure = azure.with_embedding_deployment(deployment.clone());
            }
            if let Some(version) = &config.api_version {
                azure = azure.with_api_version(version.clone());
            }
            Arc::new(RetryingBackend::new(Arc::new(azure), config.retry.clone()))
        }
        BackendType::Openai => {
            let key = config.resolve_api_key().ok_or_else(|| {
                BackendError::Config(format!("backend {} requires an api key", config.id))
            })?;
            let base_url = config
                .base_url
                .as_deref()
                .unwrap_or("https://api.openai.com/v1");
            let mut openai =
                OpenAiBackend::new(key, base_url, config.chat_model.clone()).with_timeout(timeout);
            if let Some(model) = &config.embedding_model {
                openai = openai.with_embedding_model(model.clone());
            }
            Arc::new(RetryingBackend::new(Arc::new(openai), config.retry.clone()))
        }
        BackendType::Stub => Arc::new(StubBackend::new(config.chat_model.clone())),
    };
    Ok(backend)
}

// ============================================================
// Backend Registry
// ============================================================

/// Process-wide cache of backend clients, one per client-type key.
///
/// Constructed once at startup and shared; [`BackendRegistry::register`]
/// replaces whatever is cached under a key, which is how tests swap in
/// doubles.
#[derive(Default)]
pub struct BackendRegistry {
    backends: RwLock<HashMap<String, Arc<dyn LlmBackend>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client_type: impl Into<String>, backend: Arc<dyn LlmBackend>) {
        let client_type = client_type.into();
        tracing::info!("registered backend override: {client_type}");
        let mut backends = match self.backends.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        backends.insert(client_type, backend);
    }

    pub fn get(&self, client_type: &str) -> Option<Arc<dyn LlmBackend>> {
        let backends = match self.backends.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        backends.get(client_type).cloned()
    }

    /// Return the cached client for `client_type`, creating it from `config`
    /// on first use.
    pub fn get_or_create(
        &self,
        client_type: &str,
        config: &BackendConfig,
    ) -> Result<Arc<dyn LlmBackend>, BackendError> {
        if let Some(existing) = self.get(client_type) {
            return Ok(existing);
        }

        let created = create_backend(config)?;
        let mut backends = match self.backends.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = backends
            .entry(client_type.to_string())
            .or_insert_with(|| {
                tracing::info!(
                    "created backend {client_type} ({})",
                    config.backend_type.as_str()
                );
                created
            });
        Ok(Arc::clone(entry))
    }

    pub fn remove(&self, client_type: &str) -> Option<Arc<dyn LlmBackend>> {
        let mut backends = match self.backends.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        backends.remove(client_type)
    }

    pub fn list(&self) -> Vec<String> {
        let backends = match self.backends.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut keys: Vec<String> = backends.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_caches_one_instance_per_key() {
        let registry = BackendRegistry::new();
        let config = BackendConfig::new("stub", BackendType::Stub);
        let a = registry.get_or_create("stub", &config).unwrap();
        let b = registry.get_or_create("stub", &config).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.list(), vec!["stub".to_string()]);
    }

    #[test]
    fn register_overrides_cached_instance() {
        let registry = BackendRegistry::new();
        let config = BackendConfig::new("stub", BackendType::Stub);
        let created = registry.get_or_create("stub", &config).unwrap();

        let double: Arc<dyn LlmBackend> = Arc::new(StubBackend::new("double"));
        registry.register("stub", Arc::clone(&double));

        let fetched = registry.get_or_create("stub", &config).unwrap();
        assert!(Arc::ptr_eq(&fetched, &double));
        assert!(!Arc::ptr_eq(&fetched, &created));
    }

    #[test]
    fn registry_get_unknown_is_none() {
        let registry = BackendRegistry::new();
        assert!(registry.get("missing").is_none());
        assert!(registry.remove("missing").is_none());
    }

    #[test]
    fn azure_without_key_is_config_error() {
        let config = BackendConfig::new("azure", BackendType::AzureOpenai)
            .with_base_url("https://r.openai.azure.com");
        let err = create_backend(&config).err().unwrap();
        assert!(matches!(err, BackendError::Config(_)));
        assert!(err.to_string().contains("requires an api key"));
    }

    #[test]
    fn azure_without_endpoint_is_config_error() {
        let config = BackendConfig::new("azure", BackendType::AzureOpenai).with_api_key("k");
        let err = create_backend(&config).err().unwrap();
        assert!(err.to_string().contains("requires base_url"));
    }

    #[test]
    fn api_key_env_is_used_when_inline_key_missing() {
        let var = "DOCENT_PROVIDER_TEST_KEY";
        std::env::set_var(var, "from-env");
        let config = BackendConfig {
            api_key_env: Some(var.into()),
            ..BackendConfig::new("openai", BackendType::Openai)
        };
        assert_eq!(config.resolve_api_key().as_deref(), Some("from-env"));
        std::env::remove_var(var);
    }

    #[test]
    fn backend_config_deserializes_with_defaults() {
        let config: BackendConfig = serde_json::from_value(serde_json::json!({
            "type": "azure_openai",
            "api_key": "sk",
            "base_url": "https://r.openai.azure.com",
            "chat_model": "gpt-4o-deploy",
            "retry": {"max_attempts": 5}
        }))
        .unwrap();
        assert_eq!(config.backend_type, BackendType::AzureOpenai);
        assert_eq!(config.id, "default");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.timeout_secs, 120);
    }
}
