//! Phrase documents and the value types stored on them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::LocaleInfo;

/// Opaque, immutable phrase identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhraseId(String);

impl PhraseId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PhraseId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PhraseId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for PhraseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Dense embedding vector. Adapters normalize whatever their backend returns
/// into this type; the core never sees another vector shape.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Little-endian f32 bytes, the storage encoding used by the SQLite adapter.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * 4);
        for v in &self.0 {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Decode little-endian f32 bytes. Trailing bytes that do not form a full
    /// f32 are ignored.
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self(values)
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// Logical polarity of a phrase, used to hard-filter incompatible matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Polarity {
    Positive,
    Negative,
    Neutral,
}

impl Polarity {
    /// Case-insensitive parse; unknown labels yield `None`.
    pub fn parse_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "POSITIVE" => Some(Polarity::Positive),
            "NEGATIVE" => Some(Polarity::Negative),
            "NEUTRAL" => Some(Polarity::Neutral),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Polarity::Positive => "POSITIVE",
            Polarity::Negative => "NEGATIVE",
            Polarity::Neutral => "NEUTRAL",
        }
    }
}

impl fmt::Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-target-locale coverage flags. A missing key means "not yet attempted".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TranslatedMap(BTreeMap<String, bool>);

impl TranslatedMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map with a single entry, as written on a freshly created source phrase.
    pub fn pending(locale: &str) -> Self {
        let mut map = BTreeMap::new();
        map.insert(locale.to_string(), false);
        Self(map)
    }

    pub fn is_translated(&self, locale: &str) -> bool {
        self.0.get(locale).copied().unwrap_or(false)
    }

    pub fn mark(&mut self, locale: &str) {
        self.0.insert(locale.to_string(), true);
    }

    pub fn get(&self, locale: &str) -> Option<bool> {
        self.0.get(locale).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Normalize a stored `translated` value. Older documents stored a bare
    /// boolean; `true` meant "covered everywhere", so it expands to every
    /// known locale.
    pub fn from_stored(value: &serde_json::Value, known_locales: &[String]) -> Self {
        match value {
            serde_json::Value::Bool(true) => Self(
                known_locales
                    .iter()
                    .map(|loc| (loc.clone(), true))
                    .collect(),
            ),
            serde_json::Value::Object(obj) => Self(
                obj.iter()
                    .filter_map(|(k, v)| v.as_bool().map(|b| (k.clone(), b)))
                    .collect(),
            ),
            _ => Self::default(),
        }
    }
}

/// A stored phrase in one locale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phrase {
    pub id: PhraseId,
    pub text: String,
    pub locale: String,
    pub language: String,
    pub country: String,
    pub region: String,
    pub is_slang: bool,
    pub is_question: bool,
    pub usage_count: u64,
    pub literal_embedding: Option<Embedding>,
    pub intent_embedding: Option<Embedding>,
    pub logical_polarity: Option<Polarity>,
    pub semantic_anchor: Option<String>,
    pub translated: TranslatedMap,
    pub created_at: i64,
}

impl Phrase {
    /// New phrase with a fresh id and creation timestamp. Locale metadata is
    /// copied from `info` when the locale is known.
    pub fn new(text: impl Into<String>, locale: &str, info: Option<&LocaleInfo>) -> Self {
        let (language, country, region) = match info {
            Some(i) => (i.language.clone(), i.country.clone(), i.region.clone()),
            None => (
                locale.split('-').next().unwrap_or(locale).to_string(),
                "Unknown".to_string(),
                "Unknown".to_string(),
            ),
        };
        Self {
            id: PhraseId::generate(),
            text: text.into(),
            locale: locale.to_string(),
            language,
            country,
            region,
            is_slang: false,
            is_question: false,
            usage_count: 0,
            literal_embedding: None,
            intent_embedding: None,
            logical_polarity: None,
            semantic_anchor: None,
            translated: TranslatedMap::new(),
            created_at: now_unix(),
        }
    }

    /// The vector used to bridge this phrase into other locales.
    pub fn bridge_vector(&self) -> Option<&Embedding> {
        self.intent_embedding
            .as_ref()
            .or(self.literal_embedding.as_ref())
    }
}

/// Current time as Unix timestamp (seconds).
pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn locales() -> Vec<String> {
        vec!["en-US-CA".into(), "es-CO-CTG".into(), "es-CO-MDE".into()]
    }

    #[test]
    fn legacy_true_expands_to_every_locale() {
        let map = TranslatedMap::from_stored(&json!(true), &locales());
        for loc in locales() {
            assert!(map.is_translated(&loc));
        }
    }

    #[test]
    fn legacy_false_and_null_are_empty() {
        assert_eq!(TranslatedMap::from_stored(&json!(false), &locales()), TranslatedMap::new());
        assert_eq!(TranslatedMap::from_stored(&json!(null), &locales()), TranslatedMap::new());
    }

    #[test]
    fn object_shape_keeps_only_boolean_entries() {
        let map = TranslatedMap::from_stored(
            &json!({"es-CO-CTG": true, "es-CO-MDE": false, "junk": "yes"}),
            &locales(),
        );
        assert_eq!(map.get("es-CO-CTG"), Some(true));
        assert_eq!(map.get("es-CO-MDE"), Some(false));
        assert_eq!(map.get("junk"), None);
        assert!(!map.is_translated("en-US-CA"));
    }

    #[test]
    fn embedding_bytes_survive_storage_encoding() {
        let e = Embedding::new(vec![0.25, -1.5, 3.0]);
        assert_eq!(Embedding::from_le_bytes(&e.to_le_bytes()), e);
    }

    #[test]
    fn polarity_parse_is_case_insensitive() {
        assert_eq!(Polarity::parse_loose("negative"), Some(Polarity::Negative));
        assert_eq!(Polarity::parse_loose(" Neutral "), Some(Polarity::Neutral));
        assert_eq!(Polarity::parse_loose("sarcastic"), None);
    }

    #[test]
    fn unknown_locale_falls_back_to_language_prefix() {
        let p = Phrase::new("hola", "pt-BR-RIO", None);
        assert_eq!(p.language, "pt");
        assert_eq!(p.region, "Unknown");
    }
}
