//! Evidence pack types

use serde::{Deserialize, Serialize};

/// Where an evidence item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Memory,
    Corpus,
    Vector,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Corpus => "corpus",
            Self::Vector => "vector",
        }
    }
}

/// A single fused evidence hit. Immutable for the lifetime of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub id: String,
    /// Bounded snippet of the underlying text.
    pub snippet: String,
    /// Short human-readable match explanation ("fts5 match", "term overlap").
    pub why: String,
    /// Fused score (sparse/dense mix plus entity boost).
    pub score: f64,
    pub source: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sparse_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dense_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_bonus: Option<f64>,
}

/// Ordered evidence set, bounded by the request's memory budget.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pack {
    pub items: Vec<EvidenceItem>,
}

impl Pack {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> Vec<String> {
        self.items.iter().map(|i| i.id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn top(&self) -> Option<&EvidenceItem> {
        self.items.first()
    }

    /// Snippets of the first `n` items, used to condition paraphrase
    /// sampling and refinement prompts.
    pub fn snippets(&self, n: usize) -> Vec<String> {
        self.items.iter().take(n).map(|i| i.snippet.clone()).collect()
    }

    /// Urls carried by pack items, in rank order.
    pub fn urls(&self) -> Vec<String> {
        self.items.iter().filter_map(|i| i.url.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, url: Option<&str>) -> EvidenceItem {
        EvidenceItem {
            id: id.to_string(),
            snippet: format!("snippet {id}"),
            why: "test".to_string(),
            score: 0.5,
            source: SourceType::Corpus,
            url: url.map(str::to_string),
            title: None,
            sparse_score: None,
            dense_score: None,
            entity_bonus: None,
        }
    }

    #[test]
    fn test_pack_ids_preserve_order() {
        let pack = Pack {
            items: vec![item("b", None), item("a", None)],
        };
        assert_eq!(pack.ids(), vec!["b", "a"]);
    }

    #[test]
    fn test_pack_urls_filters_missing() {
        let pack = Pack {
            items: vec![item("a", Some("https://x.test/a")), item("b", None)],
        };
        assert_eq!(pack.urls(), vec!["https://x.test/a"]);
    }
}
