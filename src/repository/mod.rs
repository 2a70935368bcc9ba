//! Phrase store abstraction: exact lookup, nearest-neighbor search, atomic
//! read-modify-write, and batched writes.

pub mod sqlite;

use async_trait::async_trait;

use crate::error::RepoError;
use crate::model::{CacheSnapshot, Embedding, Phrase, PhraseId, Polarity};

pub use sqlite::SqlitePhraseStore;

/// Which stored vector a nearest-neighbor query runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorField {
    Literal,
    Intent,
}

/// Equality predicate composed with a nearest-neighbor query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    IsSlang(bool),
    IsQuestion(bool),
}

impl Predicate {
    pub fn matches(&self, phrase: &Phrase) -> bool {
        match *self {
            Predicate::IsSlang(v) => phrase.is_slang == v,
            Predicate::IsQuestion(v) => phrase.is_question == v,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NearestQuery<'a> {
    /// `None` searches every locale.
    pub locale: Option<&'a str>,
    pub field: VectorField,
    pub vector: &'a Embedding,
    pub k: usize,
    pub filters: Vec<Predicate>,
}

impl<'a> NearestQuery<'a> {
    pub fn new(locale: Option<&'a str>, field: VectorField, vector: &'a Embedding, k: usize) -> Self {
        Self {
            locale,
            field,
            vector,
            k,
            filters: Vec::new(),
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filters.push(predicate);
        self
    }
}

/// A search hit with the index-reported cosine distance (`1 - cos`).
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub phrase: Phrase,
    pub distance: Option<f64>,
}

/// Top phrases by usage count.
#[derive(Debug, Clone)]
pub struct TopQuery<'a> {
    pub locale: Option<&'a str>,
    pub include_slang: bool,
    pub limit: usize,
}

/// One operation of an all-or-nothing batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Upsert(Phrase),
    Delete(PhraseId),
    IncrementUsage { id: PhraseId, by: u64 },
    MarkTranslated { id: PhraseId, locale: String },
    SetSemantics {
        id: PhraseId,
        polarity: Option<Polarity>,
        semantic_anchor: Option<String>,
        intent_embedding: Option<Embedding>,
    },
    SetQuestion { id: PhraseId, is_question: bool },
    PutSnapshot(CacheSnapshot),
    DeleteSnapshot(String),
}

/// Reads and writes visible inside one atomic unit.
pub trait PhraseTxn {
    fn find_exact(&mut self, locale: &str, text: &str) -> Result<Option<Phrase>, RepoError>;
    fn insert(&mut self, phrase: &Phrase) -> Result<(), RepoError>;
    fn increment_usage(&mut self, id: &PhraseId, by: u64) -> Result<(), RepoError>;
}

/// Body of a transaction. It may be invoked more than once by stores that
/// retry on contention, so it must not have side effects outside `txn`.
pub type TxnWork<'w> = dyn FnMut(&mut dyn PhraseTxn) -> Result<(), RepoError> + Send + 'w;

#[async_trait]
pub trait PhraseRepository: Send + Sync {
    async fn get(&self, id: &PhraseId) -> Result<Option<Phrase>, RepoError>;

    /// Oldest phrase with exactly this (locale, text).
    async fn find_exact(&self, locale: &str, text: &str) -> Result<Option<Phrase>, RepoError>;

    /// Up to `k` phrases ordered by ascending distance on `query.field`.
    async fn find_nearest(&self, query: &NearestQuery<'_>) -> Result<Vec<Neighbor>, RepoError>;

    async fn top_phrases(&self, query: &TopQuery<'_>) -> Result<Vec<Phrase>, RepoError>;

    async fn list_locale(&self, locale: &str) -> Result<Vec<Phrase>, RepoError>;

    /// Run `work` atomically. Concurrent transactions over the same
    /// (locale, text) never both observe it absent.
    async fn run_transaction(&self, work: &mut TxnWork<'_>) -> Result<(), RepoError>;

    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), RepoError>;

    async fn get_snapshot(&self, locale: &str) -> Result<Option<CacheSnapshot>, RepoError>;
}

/// Literal and intent nearest-neighbor searches issued in parallel.
/// Each side reports its own outcome so callers decide whether a failed
/// side degrades to empty or aborts.
pub async fn dual_nearest(
    repo: &dyn PhraseRepository,
    locale: Option<&str>,
    vector: &Embedding,
    k: usize,
    filters: &[Predicate],
) -> (Result<Vec<Neighbor>, RepoError>, Result<Vec<Neighbor>, RepoError>) {
    let mut literal = NearestQuery::new(locale, VectorField::Literal, vector, k);
    let mut intent = NearestQuery::new(locale, VectorField::Intent, vector, k);
    literal.filters.extend_from_slice(filters);
    intent.filters.extend_from_slice(filters);
    tokio::join!(repo.find_nearest(&literal), repo.find_nearest(&intent))
}

/// Typed wrapper over `run_transaction`: returns whatever the last successful
/// run of `f` produced.
pub async fn transact<T, F>(repo: &dyn PhraseRepository, mut f: F) -> Result<T, RepoError>
where
    T: Send,
    F: FnMut(&mut dyn PhraseTxn) -> Result<T, RepoError> + Send,
{
    let mut out: Option<T> = None;
    repo.run_transaction(&mut |txn: &mut dyn PhraseTxn| {
        out = Some(f(txn)?);
        Ok(())
    })
    .await?;
    out.ok_or_else(|| RepoError::Unavailable("transaction committed without a result".into()))
}
