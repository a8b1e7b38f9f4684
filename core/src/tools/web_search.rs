//! WEB_SEARCH tool
//!
//! Deterministic search backed by optional fixture data, ranked by term
//! overlap against title and snippet. Without a fixture the tool returns
//! no results; a live search provider plugs in behind the same shape.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{ToolError, ToolErrorKind};

pub const FIXTURE_ENV: &str = "ATTEST_WEB_SEARCH_FIXTURE";
const MAX_K: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

fn load_fixture(path: &Path) -> Result<Vec<WebResult>, ToolError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ToolError::new(ToolErrorKind::NetworkError, format!("fixture read: {e}")))?;
    serde_json::from_str(&raw)
        .map_err(|e| ToolError::new(ToolErrorKind::ParseError, format!("fixture parse: {e}")))
}

fn overlap_score(terms: &[String], result: &WebResult) -> usize {
    let haystack = format!(
        "{} {}",
        result.title.to_lowercase(),
        result.snippet.to_lowercase()
    );
    terms.iter().filter(|t| haystack.contains(t.as_str())).count()
}

/// Run a search for `query`, returning at most `k` results, capped at 10.
pub fn search(query: &str, k: usize) -> Result<Vec<WebResult>, ToolError> {
    let k = k.clamp(1, MAX_K);
    let Ok(fixture_path) = std::env::var(FIXTURE_ENV) else {
        return Ok(Vec::new());
    };
    let mut results = load_fixture(Path::new(&fixture_path))?;
    let terms: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if terms.is_empty() {
        results.truncate(k);
        return Ok(results);
    }
    let mut scored: Vec<(usize, WebResult)> = results
        .into_iter()
        .map(|r| (overlap_score(&terms, &r), r))
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(scored.into_iter().take(k).map(|(_, r)| r).collect())
}
