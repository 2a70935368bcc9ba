//! Tolerant parsing of generation output.
//! Models wrap JSON in prose or code fences; anything unparseable degrades
//! to a raw-text record instead of failing the translation.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::error::ProviderError;
use crate::model::Polarity;

/// Structured result of one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedGeneration {
    pub primary: String,
    /// Short gloss of the intent; empty when the model gave none.
    pub semantic_anchor: String,
    pub polarity: Polarity,
    pub is_question: bool,
    pub slang_variants: Vec<String>,
    /// True when the response was not usable JSON.
    pub degraded: bool,
}

#[derive(Deserialize)]
struct RawGeneration {
    #[serde(alias = "text", alias = "primary")]
    translation: Option<String>,
    #[serde(default)]
    semantic_anchor: Option<String>,
    #[serde(default)]
    logical_polarity: Option<String>,
    #[serde(default)]
    is_question: Option<bool>,
    #[serde(default)]
    slang_variants: Vec<serde_json::Value>,
}

fn json_object_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").unwrap())
}

fn code_fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").unwrap())
}

fn question_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^[¿?]|[¿?]$|^(what|where|who|when|why|how|can|could|would|do|does|did|is|are|am|will|shall|may|might|should)\b",
        )
        .unwrap()
    })
}

/// Question heuristic: leading/trailing `?` or `¿`, or a leading
/// interrogative word.
pub fn looks_like_question(text: &str) -> bool {
    question_re().is_match(text.trim())
}

/// Parse a raw completion. Only an empty response is an error.
pub fn parse_generation(raw: &str, slang_count: usize) -> Result<ParsedGeneration, ProviderError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ProviderError::MalformedResponse("empty completion".into()));
    }

    let structured = extract_json(raw).and_then(|gen| {
        let primary = gen.translation.as_deref().map(str::trim).unwrap_or_default();
        if primary.is_empty() {
            return None;
        }
        let primary = primary.to_string();
        let is_question = gen
            .is_question
            .unwrap_or_else(|| looks_like_question(&primary));
        let variants = clean_variants(&gen.slang_variants, &primary, slang_count);
        Some(ParsedGeneration {
            semantic_anchor: gen
                .semantic_anchor
                .map(|s| s.trim().to_string())
                .unwrap_or_default(),
            polarity: gen
                .logical_polarity
                .as_deref()
                .and_then(Polarity::parse_loose)
                .unwrap_or(Polarity::Neutral),
            is_question,
            slang_variants: variants,
            primary,
            degraded: false,
        })
    });

    Ok(structured.unwrap_or_else(|| {
        warn!(chars = raw.len(), "generation output not usable JSON, degrading to raw text");
        ParsedGeneration {
            primary: raw.to_string(),
            semantic_anchor: String::new(),
            polarity: Polarity::Neutral,
            is_question: looks_like_question(raw),
            slang_variants: Vec::new(),
            degraded: true,
        }
    }))
}

fn extract_json(raw: &str) -> Option<RawGeneration> {
    if let Some(m) = json_object_re().find(raw) {
        if let Ok(gen) = serde_json::from_str::<RawGeneration>(m.as_str()) {
            return Some(gen);
        }
    }
    let fenced = code_fence_re().captures(raw)?.get(1)?.as_str();
    serde_json::from_str(fenced.trim()).ok()
}

fn clean_variants(values: &[serde_json::Value], primary: &str, limit: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .iter()
        .filter_map(|v| v.as_str())
        .map(str::trim)
        .filter(|v| !v.is_empty() && *v != primary)
        .filter(|v| seen.insert(v.to_string()))
        .take(limit)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_wrapped_in_prose() {
        let raw = r#"Sure! Here you go:
{"translation": "¿Qué más, parce?", "semantic_anchor": "casual greeting",
 "logical_polarity": "positive", "is_question": true,
 "slang_variants": ["¿Quiubo?", "¿Qué hubo pues?"]}
Hope that helps."#;
        let g = parse_generation(raw, 5).unwrap();
        assert!(!g.degraded);
        assert_eq!(g.primary, "¿Qué más, parce?");
        assert_eq!(g.semantic_anchor, "casual greeting");
        assert_eq!(g.polarity, Polarity::Positive);
        assert!(g.is_question);
        assert_eq!(g.slang_variants, vec!["¿Quiubo?", "¿Qué hubo pues?"]);
    }

    #[test]
    fn parses_fenced_json_with_text_alias() {
        let raw = "```json\n{\"text\": \"Hola\", \"logical_polarity\": \"NEUTRAL\"}\n```";
        let g = parse_generation(raw, 5).unwrap();
        assert_eq!(g.primary, "Hola");
        assert!(!g.is_question);
        assert!(g.slang_variants.is_empty());
    }

    #[test]
    fn non_json_degrades_to_raw_text() {
        let g = parse_generation("  Hola, ¿cómo estás?  ", 5).unwrap();
        assert!(g.degraded);
        assert_eq!(g.primary, "Hola, ¿cómo estás?");
        assert_eq!(g.polarity, Polarity::Neutral);
        assert!(g.slang_variants.is_empty());
    }

    #[test]
    fn json_without_translation_degrades() {
        let g = parse_generation(r#"{"semantic_anchor": "x"}"#, 5).unwrap();
        assert!(g.degraded);
        assert_eq!(g.primary, r#"{"semantic_anchor": "x"}"#);
    }

    #[test]
    fn empty_completion_is_an_error() {
        assert!(matches!(
            parse_generation("   ", 5),
            Err(ProviderError::MalformedResponse(_))
        ));
    }

    #[test]
    fn variants_are_cleaned_and_capped() {
        let raw = r#"{"translation": "Chévere",
            "slang_variants": [" Bacano ", "Chévere", "Bacano", "", 7, "Berraco", "Melo"]}"#;
        let g = parse_generation(raw, 2).unwrap();
        assert_eq!(g.slang_variants, vec!["Bacano", "Berraco"]);
    }

    #[test]
    fn unknown_polarity_becomes_neutral() {
        let g = parse_generation(r#"{"translation": "Ok", "logical_polarity": "sarcastic"}"#, 5)
            .unwrap();
        assert_eq!(g.polarity, Polarity::Neutral);
    }

    #[test]
    fn question_heuristic() {
        assert!(looks_like_question("Where is the beach"));
        assert!(looks_like_question("¿Dónde está la playa"));
        assert!(looks_like_question("You coming?"));
        assert!(!looks_like_question("Whatever works"));
        assert!(!looks_like_question("Good morning"));
    }
}
