//! Read-optimized per-locale projection written by the rebuilder.
//! Fully replaced on every rebuild; never patched in place.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::PhraseId;

/// One ranked translation variant of a snapshot entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub text: String,
    pub is_slang: bool,
    pub is_question: bool,
    pub score: f64,
}

/// A top phrase of the source locale plus its variants, keyed by target locale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub id: PhraseId,
    pub text: String,
    pub usage_count: u64,
    pub is_slang: bool,
    pub is_question: bool,
    pub variants: BTreeMap<String, Vec<Variant>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub locale: String,
    pub phrases: Vec<SnapshotEntry>,
    pub count: usize,
    pub updated_at: i64,
}

impl CacheSnapshot {
    pub fn new(locale: impl Into<String>, phrases: Vec<SnapshotEntry>, updated_at: i64) -> Self {
        let count = phrases.len();
        Self {
            locale: locale.into(),
            phrases,
            count,
            updated_at,
        }
    }

    /// Serialized body without the timestamp; two rebuilds over the same
    /// store state produce identical bytes here.
    pub fn content_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&(&self.locale, &self.phrases, self.count))
    }
}
