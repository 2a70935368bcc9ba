//! Translation orchestrator: embed, upsert the source phrase, look for a
//! cached neighbor in the target locale, and generate on a miss.
//!
//! The only serialized write is the source-phrase upsert. Everything after it
//! (usage bumps, target inserts, slang variants, coverage flags) is
//! check-then-act and tolerates rare benign duplicates.

pub mod parse;
pub mod prompt;

use std::sync::Arc;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{LocaleInfo, LocaleTable, TranslatorConfig};
use crate::error::{PhraseCacheError, ProviderError, Result};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::model::{Embedding, Phrase, PhraseId, Polarity, TranslatedMap};
use crate::providers::{EmbeddingProvider, GenerationProvider};
use crate::repository::{dual_nearest, transact, Neighbor, PhraseRepository, WriteOp};
use crate::scoring::{is_polarity_compatible, round4, unified_score};

use parse::{looks_like_question, parse_generation, ParsedGeneration};
use prompt::{PromptParams, PromptTemplate};

#[derive(Debug, Clone)]
pub struct TranslateRequest {
    pub text: String,
    pub source_locale: String,
    pub target_locale: String,
    /// Hit threshold; `None` uses the configured default (0.7).
    pub match_threshold: Option<f64>,
    /// Skip the cache and always generate.
    pub force_refresh: bool,
}

impl TranslateRequest {
    pub fn new(
        text: impl Into<String>,
        source_locale: impl Into<String>,
        target_locale: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            source_locale: source_locale.into(),
            target_locale: target_locale.into(),
            match_threshold: None,
            force_refresh: false,
        }
    }

    pub fn threshold(mut self, threshold: f64) -> Self {
        self.match_threshold = Some(threshold);
        self
    }

    pub fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }
}

/// How the returned phrase was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeSource {
    Cache,
    Generated,
    /// Generation produced text that already existed in the target locale.
    ExistingTextMatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslateOutcome {
    pub id: PhraseId,
    pub text: String,
    pub locale: String,
    pub is_slang: bool,
    pub is_question: bool,
    pub usage_count: u64,
    pub source: OutcomeSource,
    /// Unified score of the selected match; only set on cache hits.
    pub score: Option<f64>,
}

impl TranslateOutcome {
    fn from_phrase(phrase: &Phrase, usage_count: u64, source: OutcomeSource, score: Option<f64>) -> Self {
        Self {
            id: phrase.id.clone(),
            text: phrase.text.clone(),
            locale: phrase.locale.clone(),
            is_slang: phrase.is_slang,
            is_question: phrase.is_question,
            usage_count,
            source,
            score,
        }
    }
}

/// What the upsert transaction learned about the source phrase.
#[derive(Debug, Clone)]
struct SourceState {
    id: PhraseId,
    translated: TranslatedMap,
    polarity: Option<Polarity>,
}

pub struct Translator {
    repo: Arc<dyn PhraseRepository>,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn GenerationProvider>,
    locales: LocaleTable,
    prompt: PromptTemplate,
    config: TranslatorConfig,
    metrics: Arc<MetricsRegistry>,
}

impl Translator {
    pub fn new(
        repo: Arc<dyn PhraseRepository>,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn GenerationProvider>,
        locales: LocaleTable,
    ) -> Self {
        Self {
            repo,
            embedder,
            generator,
            locales,
            prompt: PromptTemplate::default(),
            config: TranslatorConfig::default(),
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    pub fn with_prompt(mut self, prompt: PromptTemplate) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_config(mut self, config: TranslatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn locales(&self) -> &LocaleTable {
        &self.locales
    }

    pub fn repository(&self) -> &Arc<dyn PhraseRepository> {
        &self.repo
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Translate `req.text` from the source into the target locale, reusing a
    /// stored phrase when one is close enough.
    pub async fn translate(&self, req: TranslateRequest) -> Result<TranslateOutcome> {
        if req.text.is_empty() {
            return Err(PhraseCacheError::InvalidArgument("text is required".into()));
        }
        if req.source_locale.trim().is_empty() || req.target_locale.trim().is_empty() {
            return Err(PhraseCacheError::InvalidArgument(
                "source and target locale are required".into(),
            ));
        }
        let text = req.text.trim();
        if text.is_empty() {
            return Err(PhraseCacheError::InvalidArgument(
                "text cannot be empty after trimming".into(),
            ));
        }
        let source_locale = req.source_locale.as_str();
        let target_locale = req.target_locale.as_str();
        let threshold = req.match_threshold.unwrap_or(self.config.default_threshold);

        let hit_span = self.metrics.span(metric_names::TRANSLATE_HIT);

        let user_vec = self.embed(text).await?;
        let source = self.upsert_source(text, source_locale, target_locale, &user_vec).await?;

        let candidates = self.search_target(target_locale, &user_vec).await;
        let best = self.select_best(&candidates, source.polarity, &user_vec);
        let already_translated = source.translated.is_translated(target_locale);

        if !req.force_refresh {
            if let Some((neighbor, score)) = best {
                if score > threshold || already_translated {
                    let outcome = self
                        .serve_hit(&source, target_locale, neighbor, score, already_translated)
                        .await;
                    hit_span.finish();
                    return Ok(outcome);
                }
            }
        }

        let miss_span = self.metrics.span(metric_names::TRANSLATE_MISS);
        info!(
            source_locale,
            target_locale,
            best_score = best.map(|(_, s)| s).unwrap_or(0.0),
            threshold,
            force_refresh = req.force_refresh,
            "cache miss, generating"
        );
        let outcome = self
            .generate_and_store(text, source_locale, target_locale, &source, &user_vec)
            .await?;
        miss_span.finish();
        Ok(outcome)
    }

    async fn embed(&self, text: &str) -> Result<Embedding, ProviderError> {
        let span = self.metrics.span(metric_names::EMBED);
        let out = self.embedder.embed(text).await;
        span.finish();
        out
    }

    /// Create or bump the source phrase atomically.
    async fn upsert_source(
        &self,
        text: &str,
        source_locale: &str,
        target_locale: &str,
        user_vec: &Embedding,
    ) -> Result<SourceState> {
        let info = self.locales.get(source_locale);
        let state = transact(self.repo.as_ref(), |txn| {
            match txn.find_exact(source_locale, text)? {
                Some(existing) => {
                    txn.increment_usage(&existing.id, 1)?;
                    Ok(SourceState {
                        id: existing.id,
                        translated: existing.translated,
                        polarity: existing.logical_polarity,
                    })
                }
                None => {
                    let mut phrase = Phrase::new(text, source_locale, info);
                    phrase.usage_count = 1;
                    phrase.is_question = looks_like_question(text);
                    phrase.literal_embedding = Some(user_vec.clone());
                    phrase.translated = TranslatedMap::pending(target_locale);
                    txn.insert(&phrase)?;
                    Ok(SourceState {
                        id: phrase.id,
                        translated: phrase.translated,
                        polarity: None,
                    })
                }
            }
        })
        .await?;
        debug!(id = %state.id, source_locale, "source phrase upserted");
        Ok(state)
    }

    /// Dual nearest search in the target locale. A failed side counts as empty.
    async fn search_target(&self, target_locale: &str, user_vec: &Embedding) -> Vec<Neighbor> {
        let span = self.metrics.span(metric_names::NEAREST_SEARCH);
        let (literal, intent) = dual_nearest(
            self.repo.as_ref(),
            Some(target_locale),
            user_vec,
            self.config.search_k,
            &[],
        )
        .await;
        span.finish();

        let mut out = Vec::new();
        for (field, side) in [("literal", literal), ("intent", intent)] {
            match side {
                Ok(hits) => out.extend(hits),
                Err(e) => {
                    self.metrics.incr(metric_names::SEARCH_DEGRADED);
                    warn!(field, target_locale, error = %e, "vector search failed, treating as empty");
                }
            }
        }
        out
    }

    /// Highest-scoring polarity-compatible candidate. Duplicates from the two
    /// searches are scored independently; the first to reach a score wins.
    fn select_best<'a>(
        &self,
        candidates: &'a [Neighbor],
        source_polarity: Option<Polarity>,
        user_vec: &Embedding,
    ) -> Option<(&'a Neighbor, f64)> {
        let mut best = None;
        let mut max_score = 0.0;
        for candidate in candidates {
            let phrase = &candidate.phrase;
            if !is_polarity_compatible(source_polarity, phrase.logical_polarity) {
                debug!(id = %phrase.id, "candidate rejected by polarity");
                continue;
            }
            let score = unified_score(
                user_vec,
                user_vec,
                phrase.literal_embedding.as_ref(),
                phrase.intent_embedding.as_ref(),
                candidate.distance.unwrap_or(self.config.default_distance),
                phrase.is_slang,
            );
            if score > max_score {
                max_score = score;
                best = Some((candidate, score));
            }
        }
        best
    }

    async fn serve_hit(
        &self,
        source: &SourceState,
        target_locale: &str,
        hit: &Neighbor,
        score: f64,
        already_translated: bool,
    ) -> TranslateOutcome {
        let mut ops = vec![WriteOp::IncrementUsage {
            id: hit.phrase.id.clone(),
            by: 1,
        }];
        if !already_translated {
            ops.push(WriteOp::MarkTranslated {
                id: source.id.clone(),
                locale: target_locale.to_string(),
            });
        }
        if let Err(e) = self.repo.batch_write(ops).await {
            warn!(id = %hit.phrase.id, error = %e, "cache hit bookkeeping failed");
        }
        info!(id = %hit.phrase.id, target_locale, score, "cache hit");
        TranslateOutcome::from_phrase(
            &hit.phrase,
            hit.phrase.usage_count + 1,
            OutcomeSource::Cache,
            Some(round4(score)),
        )
    }

    async fn generate_and_store(
        &self,
        text: &str,
        source_locale: &str,
        target_locale: &str,
        source: &SourceState,
        user_vec: &Embedding,
    ) -> Result<TranslateOutcome> {
        let target_info = self.locales.get(target_locale);
        let source_info = self.locales.get(source_locale);
        let prompt = self.prompt.render(&PromptParams {
            text,
            location: target_info.map(|i| i.region.as_str()).unwrap_or(target_locale),
            country: target_info.map(|i| i.country.as_str()).unwrap_or("Unknown"),
            source_language: source_info
                .map(|i| i.language_name.as_str())
                .unwrap_or(source_locale),
            target_language: target_info
                .map(|i| i.language_name.as_str())
                .unwrap_or(target_locale),
            slang_count: self.config.slang_count,
            user_gender: &self.config.user_gender,
            recipient_gender: &self.config.recipient_gender,
        });

        let span = self.metrics.span(metric_names::GENERATE);
        let raw = self.generator.generate(&prompt).await;
        span.finish();
        let parsed = parse_generation(&raw?, self.config.slang_count)?;

        let anchor = parsed.semantic_anchor.as_str();
        let (primary_vec, anchor_vec) = tokio::join!(self.embed(&parsed.primary), async {
            if anchor.is_empty() {
                Ok(None)
            } else {
                self.embed(anchor).await.map(Some)
            }
        });
        let primary_vec = primary_vec?;
        let anchor_vec = anchor_vec?;
        let intent_vec = anchor_vec.clone().unwrap_or_else(|| user_vec.clone());

        let outcome = match self.repo.find_exact(target_locale, &parsed.primary).await? {
            Some(existing) => {
                if let Err(e) = self
                    .repo
                    .batch_write(vec![WriteOp::IncrementUsage {
                        id: existing.id.clone(),
                        by: 1,
                    }])
                    .await
                {
                    warn!(id = %existing.id, error = %e, "usage bump on existing target failed");
                }
                info!(id = %existing.id, target_locale, "generated text already stored");
                TranslateOutcome::from_phrase(
                    &existing,
                    existing.usage_count + 1,
                    OutcomeSource::ExistingTextMatch,
                    None,
                )
            }
            None => {
                let mut phrase = Phrase::new(parsed.primary.clone(), target_locale, target_info);
                phrase.usage_count = 1;
                phrase.is_question = parsed.is_question;
                phrase.literal_embedding = Some(primary_vec);
                phrase.intent_embedding = Some(intent_vec.clone());
                phrase.logical_polarity = Some(parsed.polarity);
                phrase.semantic_anchor = non_empty(&parsed.semantic_anchor);
                self.repo.batch_write(vec![WriteOp::Upsert(phrase.clone())]).await?;
                info!(
                    id = %phrase.id,
                    target_locale,
                    degraded = parsed.degraded,
                    variants = parsed.slang_variants.len(),
                    "generated phrase stored"
                );
                TranslateOutcome::from_phrase(&phrase, 1, OutcomeSource::Generated, None)
            }
        };

        self.store_variants(&parsed, target_locale, target_info, &intent_vec)
            .await;

        let finalize = vec![
            WriteOp::MarkTranslated {
                id: source.id.clone(),
                locale: target_locale.to_string(),
            },
            WriteOp::SetSemantics {
                id: source.id.clone(),
                polarity: Some(parsed.polarity),
                semantic_anchor: non_empty(&parsed.semantic_anchor),
                intent_embedding: anchor_vec,
            },
        ];
        if let Err(e) = self.repo.batch_write(finalize).await {
            warn!(id = %source.id, target_locale, error = %e, "failed to finalize source phrase");
        }

        Ok(outcome)
    }

    /// Insert slang variants not yet present in the target locale. Per-variant
    /// failures and a failed batch are logged and skipped.
    async fn store_variants(
        &self,
        parsed: &ParsedGeneration,
        target_locale: &str,
        target_info: Option<&LocaleInfo>,
        intent_vec: &Embedding,
    ) {
        if parsed.slang_variants.is_empty() {
            return;
        }

        let builds = parsed.slang_variants.iter().map(|variant| async move {
            match self.repo.find_exact(target_locale, variant).await {
                Ok(Some(_)) => return None,
                Ok(None) => {}
                Err(e) => {
                    warn!(variant = %variant, error = %e, "variant lookup failed, skipping");
                    self.metrics.incr(metric_names::VARIANT_SKIPPED);
                    return None;
                }
            }
            let literal = match self.embed(variant).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(variant = %variant, error = %e, "variant embedding failed, skipping");
                    self.metrics.incr(metric_names::VARIANT_SKIPPED);
                    return None;
                }
            };
            let mut phrase = Phrase::new(variant.clone(), target_locale, target_info);
            phrase.is_slang = true;
            phrase.is_question = parsed.is_question;
            phrase.usage_count = 0;
            phrase.literal_embedding = Some(literal);
            phrase.intent_embedding = Some(intent_vec.clone());
            phrase.logical_polarity = Some(parsed.polarity);
            phrase.semantic_anchor = non_empty(&parsed.semantic_anchor);
            Some(phrase)
        });

        let ops: Vec<WriteOp> = join_all(builds)
            .await
            .into_iter()
            .flatten()
            .map(WriteOp::Upsert)
            .collect();
        if ops.is_empty() {
            return;
        }
        let count = ops.len();
        match self.repo.batch_write(ops).await {
            Ok(()) => debug!(count, target_locale, "slang variants stored"),
            Err(e) => {
                warn!(count, target_locale, error = %e, "slang variant batch failed, skipping");
                self.metrics.incr(metric_names::VARIANT_SKIPPED);
            }
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}
