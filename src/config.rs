//! Pipeline configuration: TOML file, then environment overrides, then
//! validation.
//!
//! ```toml
//! concurrency = 2
//!
//! [backend]
//! id = "local-llm"
//! endpoint = "http://127.0.0.1:8080"
//! seg_length = 500
//!
//! [cache]
//! sqlite_path = "seg-cache.db"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::translate::cache::{CacheError, MemorySegmentCache, SegmentCache, TieredSegmentCache};
use crate::translate::sqlite_cache::SqliteSegmentCache;
use crate::translate::TranslatorId;

pub const ENV_API_KEY: &str = "NOVEL_TRANSLATE_API_KEY";
pub const ENV_CONCURRENCY: &str = "NOVEL_TRANSLATE_CONCURRENCY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("cache setup failed: {0}")]
    Cache(#[from] CacheError),
}

/// Backend selection, tagged by translator id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "kebab-case")]
pub enum BackendConfig {
    LocalLlm {
        endpoint: String,
        #[serde(default = "default_seg_length")]
        seg_length: usize,
        #[serde(default = "default_seg_length")]
        prev_seg_length: usize,
        #[serde(default)]
        api_key: Option<String>,
    },
    RemoteMt {
        endpoint: String,
    },
}

impl BackendConfig {
    pub fn translator_id(&self) -> TranslatorId {
        match self {
            BackendConfig::LocalLlm { .. } => TranslatorId::LocalLlm,
            BackendConfig::RemoteMt { .. } => TranslatorId::RemoteMt,
        }
    }
}

fn default_seg_length() -> usize {
    500
}

fn default_concurrency() -> usize {
    1
}

fn default_memory_capacity() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
    /// Persistent L2 cache. Memory only when unset.
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_capacity: default_memory_capacity(),
            sqlite_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub backend: BackendConfig,
    /// Shared limit for chapters in flight and segments per chapter.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl PipelineConfig {
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            backend,
            concurrency: default_concurrency(),
            cache: CacheConfig::default(),
        }
    }

    /// Load from a TOML file and apply `NOVEL_TRANSLATE_*` overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content, |key| std::env::var(key).ok())?;
        info!(path = %path.display(), backend = %config.backend.translator_id(), "config loaded");
        Ok(config)
    }

    /// Parse, override through `env`, validate.
    pub fn from_toml_str(
        content: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config: PipelineConfig = toml::from_str(content)?;
        config.apply_overrides(env)?;
        config.concurrency = config.concurrency.max(1);
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(key) = env(ENV_API_KEY) {
            if let BackendConfig::LocalLlm { api_key, .. } = &mut self.backend {
                *api_key = Some(key);
            }
        }
        if let Some(raw) = env(ENV_CONCURRENCY) {
            self.concurrency = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{ENV_CONCURRENCY}={raw}")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.backend {
            BackendConfig::LocalLlm {
                endpoint,
                seg_length,
                ..
            } => {
                if endpoint.trim().is_empty() {
                    return Err(ConfigError::Invalid("backend endpoint is empty".into()));
                }
                if *seg_length == 0 {
                    return Err(ConfigError::Invalid("seg_length must be positive".into()));
                }
            }
            BackendConfig::RemoteMt { endpoint } => {
                if endpoint.trim().is_empty() {
                    return Err(ConfigError::Invalid("backend endpoint is empty".into()));
                }
            }
        }
        Ok(())
    }

    /// Segment cache for `translator`. Only the local LLM backend is cached;
    /// each translator gets its own namespace in the shared SQLite file.
    pub fn build_cache(
        &self,
        translator: TranslatorId,
    ) -> Result<Option<Arc<dyn SegmentCache>>, ConfigError> {
        if !self.cache.enabled || translator != TranslatorId::LocalLlm {
            return Ok(None);
        }
        let cache: Arc<dyn SegmentCache> = match &self.cache.sqlite_path {
            Some(path) => {
                let namespace = format!("{translator}-seg-cache");
                let l2 = SqliteSegmentCache::open(path, &namespace)?;
                Arc::new(TieredSegmentCache::new(self.cache.memory_capacity, Arc::new(l2)))
            }
            None => Arc::new(MemorySegmentCache::new(self.cache.memory_capacity)),
        };
        Ok(Some(cache))
    }
}
