// Shared fixtures for the integration tests: deterministic embedders and
// generators plus an in-memory store.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use phrase_cache::config::{LocaleTable, TranslatorConfig};
use phrase_cache::model::{CacheSnapshot, Embedding, Phrase, PhraseId};
use phrase_cache::providers::{EmbeddingProvider, GenerationProvider};
use phrase_cache::repository::{
    NearestQuery, Neighbor, PhraseRepository, SqlitePhraseStore, TopQuery, TxnWork, WriteOp,
};
use phrase_cache::{ProviderError, RepoError, Translator};

pub const DIM: usize = 64;

pub const EN: &str = "en-US-CA";
pub const CTG: &str = "es-CO-CTG";
pub const MDE: &str = "es-CO-MDE";

/// Unit vector along axis `concept`.
pub fn concept(concept: usize) -> Embedding {
    let mut v = vec![0.0_f32; DIM];
    v[concept % DIM] = 1.0;
    Embedding::new(v)
}

/// Maps known texts to concept axes; anything else gets a pseudo-random
/// vector derived from the text.
pub struct ConceptEmbedder {
    table: HashMap<String, usize>,
    calls: AtomicUsize,
}

impl ConceptEmbedder {
    pub fn new(entries: &[(&str, usize)]) -> Self {
        Self {
            table: entries.iter().map(|(t, c)| (t.to_string(), *c)).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn pseudo_random(text: &str) -> Embedding {
    let mut reader = blake3::Hasher::new().update(text.as_bytes()).finalize_xof();
    let mut bytes = [0u8; DIM];
    reader.fill(&mut bytes);
    Embedding::new(bytes.iter().map(|b| *b as f32 / 127.5 - 1.0).collect())
}

#[async_trait]
impl EmbeddingProvider for ConceptEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(match self.table.get(text) {
            Some(c) => concept(*c),
            None => pseudo_random(text),
        })
    }

    fn model_name(&self) -> &str {
        "concept"
    }
}

/// Every call returns a fresh unit vector orthogonal to all earlier ones, so
/// nothing generated ever looks similar to anything stored.
pub struct DriftingEmbedder {
    calls: AtomicUsize,
}

pub const DRIFT_DIM: usize = 512;

impl DriftingEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    /// A vector the embedder never hands out.
    pub fn reserved() -> Embedding {
        let mut v = vec![0.0_f32; DRIFT_DIM];
        v[DRIFT_DIM - 1] = 1.0;
        Embedding::new(v)
    }
}

#[async_trait]
impl EmbeddingProvider for DriftingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Embedding, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let mut v = vec![0.0_f32; DRIFT_DIM];
        v[n % (DRIFT_DIM - 1)] = 1.0;
        Ok(Embedding::new(v))
    }

    fn model_name(&self) -> &str {
        "drifting"
    }
}

pub struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Embedding, ProviderError> {
        Err(ProviderError::Timeout)
    }

    fn model_name(&self) -> &str {
        "failing"
    }
}

/// Concept embedder that times out on one specific text.
pub struct SelectiveEmbedder {
    inner: ConceptEmbedder,
    broken: String,
}

impl SelectiveEmbedder {
    pub fn new(entries: &[(&str, usize)], broken: &str) -> Self {
        Self {
            inner: ConceptEmbedder::new(entries),
            broken: broken.to_string(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for SelectiveEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding, ProviderError> {
        if text == self.broken {
            return Err(ProviderError::Timeout);
        }
        self.inner.embed(text).await
    }

    fn model_name(&self) -> &str {
        "selective"
    }
}

/// Answers with the response of the first needle found in the prompt.
pub struct ScriptedGenerator {
    script: Vec<(String, String)>,
    fallback: Option<String>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new(script: &[(&str, &str)]) -> Self {
        Self {
            script: script
                .iter()
                .map(|(n, r)| (n.to_string(), r.to_string()))
                .collect(),
            fallback: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Same response for every prompt.
    pub fn always(response: &str) -> Self {
        Self {
            script: Vec::new(),
            fallback: Some(response.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationProvider for ScriptedGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, r)| r.clone())
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| ProviderError::Api(format!("no scripted response for prompt: {prompt}")))
    }
}

/// Plain-text `gen-N`, a new string on every call.
pub struct UniqueGenerator {
    calls: AtomicUsize,
}

impl UniqueGenerator {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationProvider for UniqueGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("gen-{n}"))
    }
}

pub struct FailingGenerator;

#[async_trait]
impl GenerationProvider for FailingGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String, ProviderError> {
        Err(ProviderError::Api("unexpected status 503".into()))
    }
}

/// Store wrapper whose vector index is down.
pub struct NoIndexRepo {
    pub inner: Arc<SqlitePhraseStore>,
}

#[async_trait]
impl PhraseRepository for NoIndexRepo {
    async fn get(&self, id: &PhraseId) -> Result<Option<Phrase>, RepoError> {
        self.inner.get(id).await
    }

    async fn find_exact(&self, locale: &str, text: &str) -> Result<Option<Phrase>, RepoError> {
        self.inner.find_exact(locale, text).await
    }

    async fn find_nearest(&self, _query: &NearestQuery<'_>) -> Result<Vec<Neighbor>, RepoError> {
        Err(RepoError::Unavailable("vector index missing".into()))
    }

    async fn top_phrases(&self, query: &TopQuery<'_>) -> Result<Vec<Phrase>, RepoError> {
        self.inner.top_phrases(query).await
    }

    async fn list_locale(&self, locale: &str) -> Result<Vec<Phrase>, RepoError> {
        self.inner.list_locale(locale).await
    }

    async fn run_transaction(&self, work: &mut TxnWork<'_>) -> Result<(), RepoError> {
        self.inner.run_transaction(work).await
    }

    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), RepoError> {
        self.inner.batch_write(ops).await
    }

    async fn get_snapshot(&self, locale: &str) -> Result<Option<CacheSnapshot>, RepoError> {
        self.inner.get_snapshot(locale).await
    }
}

pub fn store() -> Arc<SqlitePhraseStore> {
    Arc::new(SqlitePhraseStore::open_in_memory(&LocaleTable::default()).unwrap())
}

pub fn translator(
    repo: Arc<dyn PhraseRepository>,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn GenerationProvider>,
) -> Translator {
    Translator::new(repo, embedder, generator, LocaleTable::default())
        .with_config(TranslatorConfig::default())
}

/// A stored phrase with the given literal vector and no coverage yet.
pub fn seeded(text: &str, locale: &str, usage: u64, literal: Embedding) -> Phrase {
    let table = LocaleTable::default();
    let mut p = Phrase::new(text, locale, table.get(locale));
    p.usage_count = usage;
    p.literal_embedding = Some(literal);
    p
}

pub async fn put(store: &SqlitePhraseStore, phrases: Vec<Phrase>) {
    store
        .batch_write(phrases.into_iter().map(WriteOp::Upsert).collect())
        .await
        .unwrap();
}

/// JSON completion in the shape the default prompt asks for.
pub fn completion(translation: &str, anchor: &str, polarity: &str, variants: &[&str]) -> String {
    serde_json::json!({
        "translation": translation,
        "semantic_anchor": anchor,
        "logical_polarity": polarity,
        "is_question": false,
        "slang_variants": variants,
    })
    .to_string()
}
