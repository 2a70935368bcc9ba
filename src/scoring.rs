//! Similarity scoring: cosine and the blended literal/intent/index score.
//! Pure functions; every caller compares on the rounded value.

use crate::model::{Embedding, Polarity};

/// Weight of the locally computed embedding comparison in the final blend.
const MANUAL_WEIGHT: f64 = 0.7;
/// Weight of the index-reported similarity (`1 - distance`).
const INDEX_WEIGHT: f64 = 0.3;

/// Intent/literal split for slang candidates.
const SLANG_INTENT_WEIGHT: f64 = 0.8;
const SLANG_LITERAL_WEIGHT: f64 = 0.2;
/// Intent/literal split for regular candidates.
const INTENT_WEIGHT: f64 = 0.7;
const LITERAL_WEIGHT: f64 = 0.3;

/// Cosine similarity in [-1, 1]. Components missing from the shorter vector
/// count as zero. Returns 0 when either vector has zero magnitude.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| *x as f64 * *y as f64)
        .sum();
    let mag_a = a.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    let mag_b = b.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

/// Round to 4 decimal places.
#[inline]
pub fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

/// Blend literal and intent similarity with the index distance.
///
/// `index_distance` is not clamped: a negative distance yields a score above
/// 1.0, matching how the index reports it.
pub fn unified_score(
    query_literal: &Embedding,
    query_intent: &Embedding,
    doc_literal: Option<&Embedding>,
    doc_intent: Option<&Embedding>,
    index_distance: f64,
    candidate_is_slang: bool,
) -> f64 {
    let s_literal = doc_literal
        .map(|d| cosine(query_literal.as_slice(), d.as_slice()))
        .unwrap_or(0.0);
    let s_intent = doc_intent
        .map(|d| cosine(query_intent.as_slice(), d.as_slice()))
        .unwrap_or(0.0);

    let manual = if candidate_is_slang {
        SLANG_INTENT_WEIGHT * s_intent + SLANG_LITERAL_WEIGHT * s_literal
    } else {
        INTENT_WEIGHT * s_intent + LITERAL_WEIGHT * s_literal
    };
    let index_score = 1.0 - index_distance;

    round4(MANUAL_WEIGHT * manual + INDEX_WEIGHT * index_score)
}

/// Hard polarity filter: only two known, differing polarities are incompatible.
pub fn is_polarity_compatible(source: Option<Polarity>, candidate: Option<Polarity>) -> bool {
    match (source, candidate) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}
