//! phrase-cache: cross-lingual phrase cache with regional slang variants.
//! Main library: module registry, tracing setup, and the rebuild job entry point.

pub mod config;
pub mod error;
pub mod lookup;
pub mod maintenance;
pub mod metrics;
pub mod model;
pub mod providers;
pub mod rebuild;
pub mod repository;
pub mod scoring;
pub mod state_machine;
pub mod translate;

use std::sync::Arc;

use tracing::info;

pub use config::{AppConfig, LocaleInfo, LocaleTable};
pub use error::{PhraseCacheError, ProviderError, RepoError, Result};
pub use rebuild::{CacheRebuilder, Convergence, RebuildReport};
pub use translate::{OutcomeSource, TranslateOutcome, TranslateRequest, Translator};

use metrics::MetricsRegistry;
use providers::{CachedEmbeddings, HttpModelClient};
use repository::SqlitePhraseStore;
use translate::prompt::PromptTemplate;

/// Install the global tracing subscriber. Honours `RUST_LOG`;
/// `PHRASE_CACHE_LOG_FORMAT=json` switches to JSON lines for job runners.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("phrase_cache=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    // A subscriber may already be installed (tests, embedding hosts).
    let _ = match std::env::var("PHRASE_CACHE_LOG_FORMAT").as_deref() {
        Ok("json") => builder.json().try_init(),
        _ => builder.try_init(),
    };
}

/// Wire the SQLite store and the HTTP model client into a translator.
pub fn build_translator(config: &AppConfig) -> Result<Translator> {
    let locales = config.locale_table()?;
    let store = SqlitePhraseStore::open(&config.database_path, &locales)?;

    let client = Arc::new(HttpModelClient::new(&config.provider)?);
    let embedder = CachedEmbeddings::new(Arc::clone(&client), &config.embedding_cache);

    Ok(Translator::new(Arc::new(store), Arc::new(embedder), client, locales)
        .with_prompt(PromptTemplate::load(config.prompt_path.as_deref()))
        .with_config(config.translator.clone())
        .with_metrics(Arc::new(MetricsRegistry::new())))
}

/// Run one cache rebuild job configured from the environment.
pub async fn run() -> Result<RebuildReport> {
    let config = AppConfig::from_env()?;
    info!(db = %config.database_path.display(), "phrase-cache rebuild starting");

    let translator = Arc::new(build_translator(&config)?);
    let rebuilder = CacheRebuilder::new(Arc::clone(&translator), config.rebuild.clone());
    let report = rebuilder.run().await?;

    for (name, s) in translator.metrics().summary() {
        info!(metric = %name, p50_us = s.p50_us, p95_us = s.p95_us, p99_us = s.p99_us, count = s.count, "latency");
    }
    for (name, n) in translator.metrics().counters() {
        info!(metric = %name, count = n, "counter");
    }
    Ok(report)
}
