//! Configurable content guardrails
//!
//! A small deny-pattern layer applied to the incoming question (pre) and
//! the outgoing answer (post). Violations are surfaced as `guardrails`
//! events; post-stage violations additionally mark the answer with a
//! policy issue.

use regex_lite::Regex;
use tracing::warn;

/// Compiled guardrail configuration.
#[derive(Debug, Default)]
pub struct Guardrails {
    patterns: Vec<(String, Regex)>,
}

impl Guardrails {
    /// Compile deny patterns; invalid patterns are skipped with a warning
    /// rather than failing engine startup.
    pub fn from_patterns(patterns: &[String]) -> Self {
        let mut compiled = Vec::new();
        for raw in patterns {
            match Regex::new(raw) {
                Ok(re) => compiled.push((raw.clone(), re)),
                Err(e) => warn!(pattern = %raw, error = %e, "guardrail pattern skipped"),
            }
        }
        Self { patterns: compiled }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Return the deny patterns that match `text`.
    pub fn violations(&self, text: &str) -> Vec<String> {
        self.patterns
            .iter()
            .filter(|(_, re)| re.is_match(text))
            .map(|(raw, _)| raw.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violations_report_matching_patterns() {
        let guard = Guardrails::from_patterns(&[
            "(?i)credit card number".to_string(),
            "(?i)wire transfer".to_string(),
        ]);
        let hits = guard.violations("please share the Credit Card Number");
        assert_eq!(hits.len(), 1);
        assert!(hits[0].contains("credit card"));
    }

    #[test]
    fn test_invalid_pattern_skipped() {
        let guard = Guardrails::from_patterns(&["(unclosed".to_string()]);
        assert!(guard.is_empty());
        assert!(guard.violations("anything").is_empty());
    }
}
