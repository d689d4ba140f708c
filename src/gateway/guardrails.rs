use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterVerdict {
    pub allowed: bool,
    pub cleaned: String,
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait TextFilter: Send + Sync {
    async fn filter(&self, text: &str) -> Result<FilterVerdict, FilterError>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GuardrailsConfig {
    #[serde(default = "default_banned_phrases")]
    pub banned_phrases: Vec<String>,
    #[serde(default)]
    pub banned_regexes: Vec<String>,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            banned_phrases: default_banned_phrases(),
            banned_regexes: Vec::new(),
        }
    }
}

fn default_banned_phrases() -> Vec<String> {
    vec!["foo".to_string(), "badword".to_string()]
}

impl GuardrailsConfig {
    pub fn validate(&self) -> Result<(), String> {
        for raw in &self.banned_regexes {
            let pattern = raw.trim();
            if pattern.is_empty() {
                continue;
            }
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|err| format!("invalid banned_regex {pattern}: {err}"))?;
        }
        Ok(())
    }
}

/// Blocks text containing a banned phrase (case-insensitive) or matching a banned regex.
#[derive(Clone, Debug)]
pub struct PhraseFilter {
    phrases: Vec<String>,
    regexes: Vec<(String, Regex)>,
}

impl Default for PhraseFilter {
    fn default() -> Self {
        Self {
            phrases: default_banned_phrases(),
            regexes: Vec::new(),
        }
    }
}

impl PhraseFilter {
    pub fn new(config: &GuardrailsConfig) -> Result<Self, String> {
        config.validate()?;
        let phrases = config
            .banned_phrases
            .iter()
            .map(|phrase| phrase.trim().to_lowercase())
            .filter(|phrase| !phrase.is_empty())
            .collect();
        let mut regexes = Vec::new();
        for raw in &config.banned_regexes {
            let pattern = raw.trim();
            if pattern.is_empty() {
                continue;
            }
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|err| format!("invalid banned_regex {pattern}: {err}"))?;
            regexes.push((pattern.to_string(), regex));
        }
        Ok(Self { phrases, regexes })
    }

    /// Returns the rule that blocks `text`, if any.
    pub fn check_text(&self, text: &str) -> Option<String> {
        let content = text.to_lowercase();
        if let Some(phrase) = self.phrases.iter().find(|phrase| content.contains(*phrase)) {
            return Some(format!("banned_phrase:{phrase}"));
        }
        self.regexes
            .iter()
            .find(|(_, regex)| regex.is_match(text))
            .map(|(pattern, _)| format!("banned_regex:{pattern}"))
    }
}

/// Trims and collapses every whitespace run to a single space.
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl TextFilter for PhraseFilter {
    async fn filter(&self, text: &str) -> Result<FilterVerdict, FilterError> {
        let raw = text.trim();
        let blocked = self.check_text(raw);
        if let Some(rule) = blocked.as_deref() {
            tracing::debug!(rule, "text blocked by filter");
        }
        Ok(FilterVerdict {
            allowed: blocked.is_none(),
            cleaned: clean_text(raw),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cleans_whitespace_and_allows_plain_text() {
        let filter = PhraseFilter::default();
        let verdict = filter.filter("  Hello   world \n from\tRust!  ").await.unwrap();
        assert!(verdict.allowed);
        assert_eq!(verdict.cleaned, "Hello world from Rust!");
    }

    #[tokio::test]
    async fn blocks_banned_phrases_case_insensitively() {
        let filter = PhraseFilter::default();
        let verdict = filter.filter("this has a BadWord in it").await.unwrap();
        assert!(!verdict.allowed);
        assert_eq!(verdict.cleaned, "this has a BadWord in it");
        assert_eq!(
            filter.check_text("FOO bar").as_deref(),
            Some("banned_phrase:foo")
        );
    }

    #[test]
    fn regex_rules_are_applied_after_phrases() {
        let config = GuardrailsConfig {
            banned_phrases: Vec::new(),
            banned_regexes: vec![r"\b\d{3}-\d{2}-\d{4}\b".to_string(), " ".to_string()],
        };
        let filter = PhraseFilter::new(&config).expect("filter");
        assert_eq!(
            filter.check_text("ssn 123-45-6789").as_deref(),
            Some(r"banned_regex:\b\d{3}-\d{2}-\d{4}\b")
        );
        assert!(filter.check_text("nothing here").is_none());
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let config = GuardrailsConfig {
            banned_phrases: Vec::new(),
            banned_regexes: vec!["[unclosed".to_string()],
        };
        assert!(PhraseFilter::new(&config).is_err());
    }
}
