//! Similar-phrase search, optionally restricted to one locale, with an
//! optional reverse lookup of the closest phrase in the caller's own locale.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{PhraseCacheError, Result};
use crate::model::{Embedding, PhraseId};
use crate::providers::EmbeddingProvider;
use crate::repository::{dual_nearest, NearestQuery, PhraseRepository, VectorField};
use crate::scoring::{cosine, round4};

/// Minimum similarity for a match to be returned.
const MIN_SCORE: f64 = 0.7;

/// What to search for.
#[derive(Debug, Clone)]
pub enum SimilarQuery {
    Text(String),
    Embedding(Embedding),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarPhrase {
    pub id: PhraseId,
    pub text: String,
    pub locale: String,
    pub is_slang: bool,
    pub is_question: bool,
    pub usage_count: u64,
    /// max(cos(query, literal), cos(query, intent)), rounded.
    pub score: f64,
    /// Closest phrase in the requested user locale, if one was asked for.
    pub translation: Option<String>,
}

pub struct PhraseLookup {
    repo: Arc<dyn PhraseRepository>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl PhraseLookup {
    pub fn new(repo: Arc<dyn PhraseRepository>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { repo, embedder }
    }

    /// Up to `limit` phrases scoring above 0.7, best first. A `None` locale
    /// searches globally.
    pub async fn similar_phrases(
        &self,
        query: SimilarQuery,
        locale: Option<&str>,
        user_locale: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SimilarPhrase>> {
        let vector = match query {
            SimilarQuery::Embedding(v) if !v.is_empty() => v,
            SimilarQuery::Text(t) if !t.trim().is_empty() => self.embedder.embed(t.trim()).await?,
            _ => {
                return Err(PhraseCacheError::InvalidArgument(
                    "text or embedding is required".into(),
                ))
            }
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let (literal, intent) = dual_nearest(self.repo.as_ref(), locale, &vector, limit, &[]).await;
        let mut seen = HashSet::new();
        let mut matches: Vec<SimilarPhrase> = Vec::new();
        let mut sources = Vec::new();
        for neighbor in literal?.into_iter().chain(intent?) {
            if !seen.insert(neighbor.phrase.id.clone()) {
                continue;
            }
            let p = neighbor.phrase;
            let s_literal = p
                .literal_embedding
                .as_ref()
                .map(|v| cosine(vector.as_slice(), v.as_slice()))
                .unwrap_or(0.0);
            let s_intent = p
                .intent_embedding
                .as_ref()
                .map(|v| cosine(vector.as_slice(), v.as_slice()))
                .unwrap_or(0.0);
            matches.push(SimilarPhrase {
                id: p.id.clone(),
                text: p.text.clone(),
                locale: p.locale.clone(),
                is_slang: p.is_slang,
                is_question: p.is_question,
                usage_count: p.usage_count,
                score: round4(s_literal.max(s_intent)),
                translation: None,
            });
            sources.push(p.literal_embedding);
        }

        let mut scored: Vec<(SimilarPhrase, Option<Embedding>)> =
            matches.into_iter().zip(sources).collect();
        scored.retain(|(m, _)| m.score > MIN_SCORE);
        scored.sort_by(|(a, _), (b, _)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(limit);

        let mut out = Vec::with_capacity(scored.len());
        for (mut m, literal) in scored {
            if let Some(user_locale) = user_locale {
                let query = literal.as_ref().unwrap_or(&vector);
                m.translation = self.reverse_lookup(user_locale, query).await;
            }
            out.push(m);
        }
        debug!(locale = ?locale, found = out.len(), "similar phrases");
        Ok(out)
    }

    /// Text of the nearest literal neighbor in `locale`. Search failures
    /// leave the translation empty.
    async fn reverse_lookup(&self, locale: &str, vector: &Embedding) -> Option<String> {
        let query = NearestQuery::new(Some(locale), VectorField::Literal, vector, 1);
        match self.repo.find_nearest(&query).await {
            Ok(hits) => hits.into_iter().next().map(|n| n.phrase.text),
            Err(e) => {
                warn!(locale, error = %e, "reverse lookup failed");
                None
            }
        }
    }
}
