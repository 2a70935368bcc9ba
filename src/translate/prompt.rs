//! Generation prompt template with `{{PLACEHOLDER}}` substitution.

use std::path::Path;

use tracing::{info, warn};

const DEFAULT_TEMPLATE: &str = r#"Translate "{{TEXT}}" from {{SOURCE_LANGUAGE}} into {{TARGET_LANGUAGE}} as spoken in {{LOCATION}}, {{COUNTRY}}.
The speaker is {{USER_GENDER}} and is talking to someone {{RECIPIENT_GENDER}}; use the matching grammatical gender.
Also give up to {{SLANG_COUNT}} informal local slang alternatives with the same meaning.

Reply with one JSON object and nothing else:
{
  "translation": "<natural translation>",
  "semantic_anchor": "<short English description of the intent>",
  "logical_polarity": "POSITIVE | NEGATIVE | NEUTRAL",
  "is_question": true | false,
  "slang_variants": ["<variant>", "..."]
}"#;

/// Values substituted into the template.
#[derive(Debug, Clone)]
pub struct PromptParams<'a> {
    pub text: &'a str,
    pub location: &'a str,
    pub country: &'a str,
    pub source_language: &'a str,
    pub target_language: &'a str,
    pub slang_count: usize,
    pub user_gender: &'a str,
    pub recipient_gender: &'a str,
}

#[derive(Debug, Clone)]
pub struct PromptTemplate {
    template: String,
}

impl PromptTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Load from `path`, or fall back to the built-in template.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match std::fs::read_to_string(path) {
            Ok(content) if !content.trim().is_empty() => {
                info!(path = %path.display(), "prompt template loaded");
                Self::new(content)
            }
            Ok(_) => {
                warn!(path = %path.display(), "prompt template empty, using built-in");
                Self::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "prompt template load failed, using built-in");
                Self::default()
            }
        }
    }

    pub fn render(&self, p: &PromptParams<'_>) -> String {
        let slang_count = p.slang_count.to_string();
        let pairs: [(&str, &str); 8] = [
            ("{{TEXT}}", p.text),
            ("{{LOCATION}}", p.location),
            ("{{COUNTRY}}", p.country),
            ("{{SOURCE_LANGUAGE}}", p.source_language),
            ("{{TARGET_LANGUAGE}}", p.target_language),
            ("{{SLANG_COUNT}}", slang_count.as_str()),
            ("{{USER_GENDER}}", p.user_gender),
            ("{{RECIPIENT_GENDER}}", p.recipient_gender),
        ];
        // TEXT is user input and may itself contain placeholder syntax, so it
        // is substituted last.
        let mut out = self.template.clone();
        for (key, value) in pairs.iter().skip(1) {
            out = out.replace(key, value);
        }
        out.replace(pairs[0].0, pairs[0].1)
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_TEMPLATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn params(text: &str) -> PromptParams<'_> {
        PromptParams {
            text,
            location: "Medellín",
            country: "CO",
            source_language: "English",
            target_language: "Spanish",
            slang_count: 5,
            user_gender: "male",
            recipient_gender: "female",
        }
    }

    #[test]
    fn default_template_fills_every_placeholder() {
        let out = PromptTemplate::default().render(&params("How are you?"));
        assert!(out.contains("\"How are you?\""));
        assert!(out.contains("Medellín, CO"));
        assert!(out.contains("up to 5"));
        assert!(!out.contains("{{"));
    }

    #[test]
    fn user_text_is_not_reinterpreted() {
        let tpl = PromptTemplate::new("{{TEXT}} -> {{LOCATION}}");
        assert_eq!(tpl.render(&params("say {{LOCATION}}")), "say {{LOCATION}} -> Medellín");
    }

    #[test]
    fn missing_file_falls_back_to_builtin() {
        let tpl = PromptTemplate::load(Some(Path::new("/nonexistent/prompt.txt")));
        assert!(tpl.render(&params("hi")).contains("slang_variants"));
    }

    #[test]
    fn template_loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "T={{{{TEXT}}}} L={{{{TARGET_LANGUAGE}}}}").unwrap();
        let tpl = PromptTemplate::load(Some(file.path()));
        assert_eq!(tpl.render(&params("hi")), "T=hi L=Spanish");
    }
}
