use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use docent_provider::{BackendConfig, BackendType};
use serde::{Deserialize, Serialize};

use crate::chunker::ChunkerConfig;
use crate::factory::GeneratorKind;
use crate::generator::{DEFAULT_MAX_CONTEXT_CHUNKS, DEFAULT_MAX_TOKENS};
use crate::templates::{PromptTemplate, TemplateRegistry};

pub const CONFIG_FILE: &str = "docent.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Relative paths resolve against the config root.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/docent.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub default_generator: GeneratorKind,
    #[serde(default = "default_true")]
    pub use_rag: bool,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_context_chunks")]
    pub max_context_chunks: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_max_context_chunks() -> usize {
    DEFAULT_MAX_CONTEXT_CHUNKS
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_generator: GeneratorKind::default(),
            use_rag: true,
            max_tokens: DEFAULT_MAX_TOKENS,
            max_context_chunks: DEFAULT_MAX_CONTEXT_CHUNKS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub documents_dir: Option<PathBuf>,
    #[serde(flatten)]
    pub chunker: ChunkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    #[serde(default = "default_days")]
    pub default_days: u32,
    /// Conversations scanned for feedback mirrored into their metadata.
    #[serde(default = "default_mirror_scan_limit")]
    pub mirror_scan_limit: usize,
}

fn default_days() -> u32 {
    30
}

fn default_mirror_scan_limit() -> usize {
    1000
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            default_days: default_days(),
            mirror_scan_limit: default_mirror_scan_limit(),
        }
    }
}

/// Contents of `config/docent.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocentConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub templates: Vec<PromptTemplate>,
    #[serde(default)]
    pub feedback: FeedbackConfig,
}

impl DocentConfig {
    pub fn database_path(&self, root: &Path) -> PathBuf {
        resolve_under(root, &self.database.path)
    }

    pub fn documents_dir(&self, root: &Path) -> Option<PathBuf> {
        self.retrieval
            .documents_dir
            .as_ref()
            .map(|dir| resolve_under(root, dir))
    }

    /// Built-in templates with configured ones registered on top.
    pub fn template_registry(&self) -> Result<TemplateRegistry> {
        let mut registry = TemplateRegistry::new();
        for template in &self.templates {
            registry
                .register(template.clone())
                .with_context(|| format!("invalid template {}", template.name))?;
        }
        Ok(registry)
    }
}

fn resolve_under(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Expand `${VAR}` references from the environment; unset variables expand
/// to the empty string.
pub fn resolve_env_var(raw: &str) -> String {
    let mut output = String::new();
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);

        let candidate = &rest[start + 2..];
        let Some(end) = candidate.find('}') else {
            output.push_str(&rest[start..]);
            return output;
        };

        let key = &candidate[..end];
        output.push_str(&std::env::var(key).unwrap_or_default());
        rest = &candidate[end + 1..];
    }

    output.push_str(rest);
    output
}

fn resolve_backend_env(backend: &mut BackendConfig) {
    if let Some(key) = backend.api_key.as_mut() {
        *key = resolve_env_var(key);
    }
    if let Some(url) = backend.base_url.as_mut() {
        *url = resolve_env_var(url);
    }
}

/// Load `<config_dir>/docent.yaml`. A missing file yields defaults.
pub fn load_config(config_dir: &Path) -> Result<DocentConfig> {
    let path = config_dir.join(CONFIG_FILE);
    let mut config: DocentConfig = if path.exists() {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse yaml file: {}", path.display()))?
    } else {
        tracing::warn!("config file {} not found, using defaults", path.display());
        DocentConfig::default()
    };

    resolve_backend_env(&mut config.backend);
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &DocentConfig) -> Result<()> {
    config.template_registry()?;

    let backend = &config.backend;
    match backend.backend_type {
        BackendType::AzureOpenai | BackendType::Openai => {
            if backend.resolve_api_key().is_none() {
                return Err(anyhow!(
                    "backend {} ({}) has no api key; set api_key or api_key_env",
                    backend.id,
                    backend.backend_type.as_str()
                ));
            }
            if backend.backend_type == BackendType::AzureOpenai
                && backend.base_url.as_deref().unwrap_or_default().is_empty()
            {
                return Err(anyhow!("backend {} requires base_url", backend.id));
            }
        }
        BackendType::Stub => {}
    }

    if config.retrieval.enabled && config.retrieval.documents_dir.is_none() {
        return Err(anyhow!("retrieval.enabled requires retrieval.documents_dir"));
    }
    if config.retrieval.chunker.chunk_size == 0 {
        return Err(anyhow!("retrieval.chunk_size must be positive"));
    }
    if config.generation.max_tokens == 0 {
        return Err(anyhow!("generation.max_tokens must be positive"));
    }
    if config.feedback.default_days == 0 {
        return Err(anyhow!("feedback.default_days must be positive"));
    }
    if config.feedback.mirror_scan_limit == 0 {
        return Err(anyhow!("feedback.mirror_scan_limit must be positive"));
    }
    Ok(())
}
