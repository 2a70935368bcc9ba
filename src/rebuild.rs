//! Cache rebuild job.
//!
//! Phase A repeatedly walks the top phrases of every locale and fills
//! coverage gaps, either by finding an existing close neighbor or by
//! translating. It stops once a pass generates nothing, or at the
//! iteration cap. Phase B then builds one snapshot per source locale and
//! writes them all in a single batch.
//!
//! Per-pair failures (searches, translations, coverage flags) are logged
//! and counted. Only listing a locale's top phrases and the final snapshot
//! write abort the run.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RebuildConfig;
use crate::error::Result;
use crate::metrics::metric_names;
use crate::model::{now_unix, CacheSnapshot, Embedding, Phrase, SnapshotEntry, Variant};
use crate::repository::{dual_nearest, Neighbor, Predicate, PhraseRepository, TopQuery, WriteOp};
use crate::scoring::unified_score;
use crate::state_machine::{RebuildState, StateMachine};
use crate::translate::{OutcomeSource, TranslateRequest, Translator};

/// How Phase A ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Convergence {
    /// A full pass generated nothing.
    Stable,
    /// Stopped at `max_iterations` with gaps possibly left.
    IterationCapReached,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub iterations: usize,
    pub convergence: Convergence,
    /// Pairs that went through generation (Phase A and policy 3).
    pub generated: usize,
    /// Pairs marked covered by the cheap neighbor check.
    pub covered_by_search: usize,
    /// Per-pair failures that were logged and skipped.
    pub failures: usize,
    pub snapshots: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReseedReport {
    pub retranslated: usize,
    pub failures: usize,
    pub rebuild: RebuildReport,
}

#[derive(Debug, Default)]
struct PassStats {
    generated: usize,
    covered: usize,
    failures: usize,
}

/// A scored snapshot candidate.
#[derive(Debug, Clone)]
struct Ranked {
    phrase: Phrase,
    score: f64,
}

pub struct CacheRebuilder {
    translator: Arc<Translator>,
    repo: Arc<dyn PhraseRepository>,
    config: RebuildConfig,
    state: Arc<StateMachine>,
}

impl CacheRebuilder {
    pub fn new(translator: Arc<Translator>, config: RebuildConfig) -> Self {
        let repo = Arc::clone(translator.repository());
        Self {
            translator,
            repo,
            config,
            state: Arc::new(StateMachine::new()),
        }
    }

    pub fn state(&self) -> &Arc<StateMachine> {
        &self.state
    }

    /// Configured locales, or every locale the translator knows.
    pub fn locales(&self) -> Vec<String> {
        if self.config.locales.is_empty() {
            self.translator.locales().codes()
        } else {
            self.config.locales.clone()
        }
    }

    /// Full rebuild with the configured per-locale limit.
    pub async fn run(&self) -> Result<RebuildReport> {
        self.run_with_limit(self.config.limit).await
    }

    pub async fn run_with_limit(&self, limit: usize) -> Result<RebuildReport> {
        if self.state.current().is_terminal() {
            self.enter(RebuildState::Idle);
        }
        match self.run_phases(limit).await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.state.fail();
                warn!(error = %e, "cache rebuild aborted");
                Err(e)
            }
        }
    }

    /// Force re-translation of the global top `limit` phrases into every other
    /// locale, then rebuild with the same limit.
    pub async fn reseed(&self, limit: usize) -> Result<ReseedReport> {
        let locales = self.locales();
        let top = self
            .repo
            .top_phrases(&TopQuery {
                locale: None,
                include_slang: true,
                limit,
            })
            .await?;
        info!(phrases = top.len(), limit, "reseeding top phrases");

        let mut retranslated = 0;
        let mut failures = 0;
        let mut first = true;
        for phrase in &top {
            for target in locales.iter().filter(|l| **l != phrase.locale) {
                if !first {
                    tokio::time::sleep(self.config.reseed_pause).await;
                }
                first = false;
                let req = TranslateRequest::new(&phrase.text, &phrase.locale, target)
                    .force_refresh(true);
                match self.translator.translate(req).await {
                    Ok(_) => retranslated += 1,
                    Err(e) => {
                        failures += 1;
                        warn!(text = %phrase.text, target = %target, error = %e, "reseed translation failed");
                    }
                }
            }
        }

        let rebuild = self.run_with_limit(limit).await?;
        Ok(ReseedReport {
            retranslated,
            failures,
            rebuild,
        })
    }

    fn enter(&self, next: RebuildState) {
        if let Err(e) = self.state.transition(next) {
            debug!(error = %e, "state transition skipped");
        }
    }

    async fn run_phases(&self, limit: usize) -> Result<RebuildReport> {
        let locales = self.locales();
        let max_iterations = self.config.max_iterations.max(1);
        info!(locales = ?locales, limit, max_iterations, "starting cache rebuild");

        let mut totals = PassStats::default();
        let mut iterations = 0;
        let mut convergence = Convergence::IterationCapReached;

        while iterations < max_iterations {
            iterations += 1;
            self.enter(RebuildState::Converging(iterations));
            let span = self.translator.metrics().span(metric_names::REBUILD_PASS);
            let pass = self.coverage_pass(&locales, limit).await?;
            span.finish();
            info!(
                iteration = iterations,
                generated = pass.generated,
                covered = pass.covered,
                failures = pass.failures,
                "coverage pass complete"
            );
            totals.generated += pass.generated;
            totals.covered += pass.covered;
            totals.failures += pass.failures;
            if pass.generated == 0 {
                convergence = Convergence::Stable;
                break;
            }
        }
        self.enter(match convergence {
            Convergence::Stable => RebuildState::Stable,
            Convergence::IterationCapReached => RebuildState::IterationCapReached,
        });
        if convergence == Convergence::IterationCapReached {
            info!(iterations, "iteration cap reached, snapshots will fill remaining gaps");
        }

        self.enter(RebuildState::Snapshotting);
        let mut snapshots = Vec::with_capacity(locales.len());
        for source_locale in &locales {
            let span = self.translator.metrics().span(metric_names::SNAPSHOT_BUILD);
            let snapshot = self
                .build_snapshot(source_locale, &locales, limit, &mut totals)
                .await?;
            span.finish();
            debug!(locale = %source_locale, count = snapshot.count, "snapshot built");
            snapshots.push(snapshot);
        }
        let snapshot_count = snapshots.len();
        self.repo
            .batch_write(snapshots.into_iter().map(WriteOp::PutSnapshot).collect())
            .await?;
        self.enter(RebuildState::Done);

        let report = RebuildReport {
            iterations,
            convergence,
            generated: totals.generated,
            covered_by_search: totals.covered,
            failures: totals.failures,
            snapshots: snapshot_count,
        };
        info!(report = ?report, "cache rebuild complete");
        Ok(report)
    }

    async fn top_sources(&self, locale: &str, limit: usize) -> Result<Vec<Phrase>> {
        Ok(self
            .repo
            .top_phrases(&TopQuery {
                locale: Some(locale),
                include_slang: false,
                limit,
            })
            .await?)
    }

    /// One Phase A pass over every (source phrase, other locale) pair.
    async fn coverage_pass(&self, locales: &[String], limit: usize) -> Result<PassStats> {
        let mut stats = PassStats::default();
        for source_locale in locales {
            let sources = self.top_sources(source_locale, limit).await?;
            for phrase in &sources {
                for target in locales.iter().filter(|l| *l != source_locale) {
                    if phrase.translated.is_translated(target) {
                        continue;
                    }
                    if self.is_covered(phrase, target).await {
                        let mark = WriteOp::MarkTranslated {
                            id: phrase.id.clone(),
                            locale: target.clone(),
                        };
                        match self.repo.batch_write(vec![mark]).await {
                            Ok(()) => stats.covered += 1,
                            Err(e) => {
                                stats.failures += 1;
                                warn!(text = %phrase.text, target = %target, error = %e, "coverage flag write failed");
                            }
                        }
                        continue;
                    }

                    let req = TranslateRequest::new(&phrase.text, source_locale, target);
                    match self.translator.translate(req).await {
                        Ok(outcome) if outcome.source == OutcomeSource::Cache => {}
                        Ok(outcome) => {
                            debug!(text = %phrase.text, target = %target, result = %outcome.text, "pair generated");
                            stats.generated += 1;
                        }
                        Err(e) => {
                            stats.failures += 1;
                            warn!(text = %phrase.text, target = %target, error = %e, "pair translation failed");
                        }
                    }
                }
            }
        }
        Ok(stats)
    }

    /// Cheap coverage check: any neighbor in `target` with `1 - distance`
    /// at or above the coverage threshold.
    async fn is_covered(&self, phrase: &Phrase, target: &str) -> bool {
        let Some(vector) = phrase.bridge_vector() else {
            return false;
        };
        self.search(target, vector, self.config.coverage_k, &[])
            .await
            .iter()
            .filter_map(|n| n.distance)
            .any(|d| 1.0 - d >= self.config.coverage_threshold)
    }

    /// Dual nearest search in `target`. A failed side is logged, counted and
    /// treated as empty so the pair falls through to translation.
    async fn search(
        &self,
        target: &str,
        vector: &Embedding,
        k: usize,
        filters: &[Predicate],
    ) -> Vec<Neighbor> {
        let (literal, intent) =
            dual_nearest(self.repo.as_ref(), Some(target), vector, k, filters).await;
        let mut out = Vec::new();
        for (field, side) in [("literal", literal), ("intent", intent)] {
            match side {
                Ok(hits) => out.extend(hits),
                Err(e) => {
                    self.translator.metrics().incr(metric_names::SEARCH_DEGRADED);
                    warn!(field, target, error = %e, "rebuild search failed, treating as empty");
                }
            }
        }
        out
    }

    async fn build_snapshot(
        &self,
        source_locale: &str,
        locales: &[String],
        limit: usize,
        totals: &mut PassStats,
    ) -> Result<CacheSnapshot> {
        let sources = self.top_sources(source_locale, limit).await?;
        let mut entries = Vec::with_capacity(sources.len());
        for phrase in &sources {
            let mut variants = BTreeMap::new();
            for target in locales.iter().filter(|l| *l != source_locale) {
                let list = self.variants_for(phrase, target, totals).await;
                variants.insert(target.clone(), list);
            }
            entries.push(SnapshotEntry {
                id: phrase.id.clone(),
                text: phrase.text.clone(),
                usage_count: phrase.usage_count,
                is_slang: phrase.is_slang,
                is_question: phrase.is_question,
                variants,
            });
        }
        Ok(CacheSnapshot::new(source_locale, entries, now_unix()))
    }

    /// Ranked variants of `phrase` in `target`, by the three selection policies.
    /// Never fails: a broken search or generation leaves fewer variants.
    async fn variants_for(
        &self,
        phrase: &Phrase,
        target: &str,
        totals: &mut PassStats,
    ) -> Vec<Variant> {
        let ranked = match phrase.bridge_vector() {
            Some(vector) => {
                let candidates = self
                    .search(
                        target,
                        vector,
                        self.config.snapshot_k,
                        &[Predicate::IsQuestion(phrase.is_question)],
                    )
                    .await;
                rank_candidates(phrase, vector, candidates.into_iter())
            }
            None => Vec::new(),
        };

        // Policy 1: every candidate above the strict threshold, first text wins.
        let mut seen = HashSet::new();
        let strong: Vec<Variant> = ranked
            .iter()
            .filter(|r| r.score > self.config.strict_threshold)
            .filter(|r| seen.insert(r.phrase.text.clone()))
            .map(to_variant)
            .collect();
        if !strong.is_empty() {
            return strong;
        }

        // Policy 2: best-effort fallback for pairs already confirmed covered.
        if let Some(best) = ranked.first() {
            if best.score > self.config.fallback_threshold && phrase.translated.is_translated(target) {
                return vec![to_variant(best)];
            }
        }

        // Policy 3: generate on the spot.
        let req = TranslateRequest::new(&phrase.text, &phrase.locale, target);
        match self.translator.translate(req).await {
            Ok(outcome) => {
                if outcome.source != OutcomeSource::Cache {
                    totals.generated += 1;
                }
                vec![Variant {
                    text: outcome.text,
                    is_slang: outcome.is_slang,
                    is_question: outcome.is_question,
                    score: 1.0,
                }]
            }
            Err(e) => {
                totals.failures += 1;
                warn!(text = %phrase.text, target, error = %e, "snapshot generation failed, leaving pair empty");
                Vec::new()
            }
        }
    }
}

/// Score distinct candidates (best score per id) and order them by score
/// desc, then text, then id.
fn rank_candidates(
    phrase: &Phrase,
    bridge: &Embedding,
    candidates: impl Iterator<Item = Neighbor>,
) -> Vec<Ranked> {
    let query_literal = phrase.literal_embedding.as_ref().unwrap_or(bridge);
    let mut by_id: HashMap<String, Ranked> = HashMap::new();
    for n in candidates {
        let score = unified_score(
            query_literal,
            bridge,
            n.phrase.literal_embedding.as_ref(),
            n.phrase.intent_embedding.as_ref(),
            n.distance.unwrap_or(0.5),
            n.phrase.is_slang,
        );
        match by_id.get_mut(n.phrase.id.as_str()) {
            Some(existing) if existing.score >= score => {}
            Some(existing) => existing.score = score,
            None => {
                by_id.insert(
                    n.phrase.id.to_string(),
                    Ranked {
                        phrase: n.phrase,
                        score,
                    },
                );
            }
        }
    }
    let mut ranked: Vec<Ranked> = by_id.into_values().collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.phrase.text.cmp(&b.phrase.text))
            .then_with(|| a.phrase.id.cmp(&b.phrase.id))
    });
    ranked
}

fn to_variant(r: &Ranked) -> Variant {
    Variant {
        text: r.phrase.text.clone(),
        is_slang: r.phrase.is_slang,
        is_question: r.phrase.is_question,
        score: r.score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(text: &str, id: &str, lit: &[f32], distance: f64) -> Neighbor {
        let mut p = Phrase::new(text, "es-CO-CTG", None);
        p.id = id.into();
        p.literal_embedding = Some(Embedding::new(lit.to_vec()));
        Neighbor {
            phrase: p,
            distance: Some(distance),
        }
    }

    #[test]
    fn duplicate_ids_keep_their_best_score() {
        let mut source = Phrase::new("Hi", "en-US-CA", None);
        let q = Embedding::new(vec![1.0, 0.0]);
        source.literal_embedding = Some(q.clone());

        let ranked = rank_candidates(
            &source,
            &q,
            vec![
                candidate("Hola", "a", &[1.0, 0.0], 0.9),
                candidate("Hola", "a", &[1.0, 0.0], 0.0),
                candidate("Buenas", "b", &[0.0, 1.0], 0.5),
            ]
            .into_iter(),
        );
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].phrase.text, "Hola");
        // 0.7 * (0.3 * 1.0) + 0.3 * 1.0
        assert_eq!(ranked[0].score, 0.51);
    }

    #[test]
    fn ties_break_on_text_then_id() {
        let source = Phrase::new("Hi", "en-US-CA", None);
        let q = Embedding::new(vec![1.0, 0.0]);
        let ranked = rank_candidates(
            &source,
            &q,
            vec![
                candidate("b", "2", &[1.0, 0.0], 0.1),
                candidate("a", "3", &[1.0, 0.0], 0.1),
                candidate("a", "1", &[1.0, 0.0], 0.1),
            ]
            .into_iter(),
        );
        let order: Vec<_> = ranked.iter().map(|r| r.phrase.id.as_str()).collect();
        assert_eq!(order, vec!["1", "3", "2"]);
    }
}
