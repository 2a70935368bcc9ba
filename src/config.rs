//! Configuration: injected locale table, provider endpoints, and the tunables
//! of the translator and rebuilder.
//! The locale table loads from a JSON file; everything else reads from the
//! environment with defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PhraseCacheError;

/// Language, country and region of one supported locale code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocaleInfo {
    pub code: String,
    /// ISO 639-1 language code, e.g. "es".
    pub language: String,
    /// Human language name used in prompts, e.g. "Spanish".
    pub language_name: String,
    pub country: String,
    pub region: String,
}

/// On-disk locale file format.
#[derive(Debug, Deserialize)]
struct LocaleFile {
    locales: Vec<LocaleInfo>,
}

/// The set of supported locales, in a stable order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocaleTable {
    locales: Vec<LocaleInfo>,
}

impl LocaleTable {
    pub fn new(locales: Vec<LocaleInfo>) -> Self {
        Self { locales }
    }

    /// Load the table from a JSON file: `{"locales": [{code, language, ...}]}`.
    pub fn load_from_file(path: &Path) -> Result<Self, PhraseCacheError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PhraseCacheError::Config(format!("locale file {}: {e}", path.display()))
        })?;
        let file: LocaleFile = serde_json::from_str(&content).map_err(|e| {
            PhraseCacheError::Config(format!("locale file {}: {e}", path.display()))
        })?;
        if file.locales.is_empty() {
            return Err(PhraseCacheError::Config(format!(
                "locale file {} lists no locales",
                path.display()
            )));
        }
        Ok(Self::new(file.locales))
    }

    pub fn get(&self, code: &str) -> Option<&LocaleInfo> {
        self.locales.iter().find(|l| l.code == code)
    }

    pub fn contains(&self, code: &str) -> bool {
        self.get(code).is_some()
    }

    pub fn codes(&self) -> Vec<String> {
        self.locales.iter().map(|l| l.code.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocaleInfo> {
        self.locales.iter()
    }

    pub fn len(&self) -> usize {
        self.locales.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locales.is_empty()
    }
}

impl Default for LocaleTable {
    fn default() -> Self {
        let entry = |code: &str, language: &str, name: &str, country: &str, region: &str| LocaleInfo {
            code: code.into(),
            language: language.into(),
            language_name: name.into(),
            country: country.into(),
            region: region.into(),
        };
        Self::new(vec![
            entry("en-US-CA", "en", "English", "US", "California"),
            entry("es-CO-CTG", "es", "Spanish", "CO", "Cartagena"),
            entry("es-CO-MDE", "es", "Spanish", "CO", "Medellín"),
        ])
    }
}

/// Endpoint settings for an OpenAI-compatible model API.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    pub api_key_var: String,
    pub chat_model: String,
    pub embedding_model: String,
    pub request_timeout: Duration,
    /// Minimum spacing between requests (simple token bucket).
    pub min_interval: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".into(),
            api_key_var: "MODEL_API_KEY".into(),
            chat_model: "gpt-4o-mini".into(),
            embedding_model: "text-embedding-3-small".into(),
            request_timeout: Duration::from_secs(30),
            min_interval: Duration::from_millis(100), // 10 req/s
        }
    }
}

/// Tunables of the translation orchestrator.
#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    pub default_threshold: f64,
    /// Neighbors fetched per vector field when looking for a cache hit.
    pub search_k: usize,
    /// Distance assumed when the index reports none.
    pub default_distance: f64,
    pub slang_count: usize,
    pub user_gender: String,
    pub recipient_gender: String,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            default_threshold: 0.7,
            search_k: 5,
            default_distance: 0.5,
            slang_count: 5,
            user_gender: "male".into(),
            recipient_gender: "female".into(),
        }
    }
}

/// Tunables of the cache rebuild job.
#[derive(Debug, Clone)]
pub struct RebuildConfig {
    /// Locales to rebuild; empty means every locale in the table.
    pub locales: Vec<String>,
    pub limit: usize,
    pub max_iterations: usize,
    /// Minimum `1 - distance` for the cheap coverage check.
    pub coverage_threshold: f64,
    pub coverage_k: usize,
    /// Policy 1: include every candidate strictly above this.
    pub strict_threshold: f64,
    /// Policy 2: best-effort single candidate above this when coverage was confirmed.
    pub fallback_threshold: f64,
    pub snapshot_k: usize,
    /// Pause between forced re-translations during a reseed.
    pub reseed_pause: Duration,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            locales: Vec::new(),
            limit: 100,
            max_iterations: 3,
            coverage_threshold: 0.7,
            coverage_k: 1,
            strict_threshold: 0.7,
            fallback_threshold: 0.6,
            snapshot_k: 20,
            reseed_pause: Duration::from_millis(800),
        }
    }
}

/// Embedding memo settings.
#[derive(Debug, Clone)]
pub struct EmbeddingCacheConfig {
    pub capacity: usize,
    pub ttl: Duration,
}

impl Default for EmbeddingCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// Everything the job runner needs.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub locales_path: Option<PathBuf>,
    pub prompt_path: Option<PathBuf>,
    pub provider: ProviderConfig,
    pub translator: TranslatorConfig,
    pub rebuild: RebuildConfig,
    pub embedding_cache: EmbeddingCacheConfig,
}

impl AppConfig {
    /// Build the configuration from `PHRASE_CACHE_*` environment variables.
    pub fn from_env() -> Result<Self, PhraseCacheError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PhraseCacheError> {
        let mut provider = ProviderConfig::default();
        if let Some(v) = lookup("PHRASE_CACHE_BASE_URL") {
            provider.base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = lookup("PHRASE_CACHE_API_KEY_VAR") {
            provider.api_key_var = v;
        }
        if let Some(v) = lookup("PHRASE_CACHE_CHAT_MODEL") {
            provider.chat_model = v;
        }
        if let Some(v) = lookup("PHRASE_CACHE_EMBED_MODEL") {
            provider.embedding_model = v;
        }

        let mut rebuild = RebuildConfig::default();
        if let Some(v) = lookup("PHRASE_CACHE_REBUILD_LIMIT") {
            rebuild.limit = v.parse().map_err(|_| {
                PhraseCacheError::Config(format!("PHRASE_CACHE_REBUILD_LIMIT is not a number: {v}"))
            })?;
        }
        if let Some(v) = lookup("PHRASE_CACHE_REBUILD_LOCALES") {
            rebuild.locales = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        Ok(Self {
            database_path: lookup("PHRASE_CACHE_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("phrases.db")),
            locales_path: lookup("PHRASE_CACHE_LOCALES").map(PathBuf::from),
            prompt_path: lookup("PHRASE_CACHE_PROMPT").map(PathBuf::from),
            provider,
            translator: TranslatorConfig::default(),
            rebuild,
            embedding_cache: EmbeddingCacheConfig::default(),
        })
    }

    /// Locale table from the configured file, or the built-in default.
    pub fn locale_table(&self) -> Result<LocaleTable, PhraseCacheError> {
        match &self.locales_path {
            Some(path) => LocaleTable::load_from_file(path),
            None => Ok(LocaleTable::default()),
        }
    }
}
