//! Sparse lexical search over the workspace database
//!
//! Memory and corpus rows are matched through their FTS5 shadow tables
//! when present; a recency-bounded term-overlap scan is the fallback so a
//! workspace without the FTS extension still retrieves.

use rusqlite::Connection;
use tracing::debug;

use crate::errors::{Result, RetrievalError};
use crate::pack::SourceType;

const SNIPPET_MAX_CHARS: usize = 240;
const SCAN_WINDOW: usize = 200;

/// A raw lexical hit before fusion.
#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub id: String,
    pub snippet: String,
    pub why: String,
    pub score: f64,
    pub source: SourceType,
    pub url: Option<String>,
    pub title: Option<String>,
    pub entities: Vec<String>,
}

fn snippet_of(text: &str) -> String {
    if text.chars().count() <= SNIPPET_MAX_CHARS {
        return text.to_string();
    }
    text.chars().take(SNIPPET_MAX_CHARS).collect()
}

fn term_overlap(query: &str, text: &str) -> f64 {
    let terms: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if terms.is_empty() {
        return 0.0;
    }
    let haystack = text.to_lowercase();
    let hits = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    hits as f64 / terms.len() as f64
}

fn fts_table_exists(conn: &Connection, table: &str) -> bool {
    conn.query_row(
        "SELECT name FROM sqlite_master WHERE type='table' AND name=?1",
        [table],
        |_| Ok(()),
    )
    .is_ok()
}

/// Escape a freeform query for FTS5 MATCH by quoting each term.
fn fts_match_expr(query: &str) -> String {
    query
        .split_whitespace()
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Search recent memory entries, optionally restricted to one domain.
pub fn search_memory(
    conn: &Connection,
    query: &str,
    k: usize,
    domain: Option<&str>,
) -> Result<Vec<LexicalHit>> {
    if fts_table_exists(conn, "memory_fts") {
        let expr = fts_match_expr(query);
        if !expr.is_empty() {
            let sql = match domain {
                Some(_) => {
                    "SELECT m.id, m.text FROM memory_fts f \
                     JOIN memory m ON m.id = f.id \
                     WHERE memory_fts MATCH ?1 AND m.domain = ?3 LIMIT ?2"
                }
                None => {
                    "SELECT m.id, m.text FROM memory_fts f \
                     JOIN memory m ON m.id = f.id WHERE memory_fts MATCH ?1 LIMIT ?2"
                }
            };
            let mut stmt = conn
                .prepare(sql)
                .map_err(|e| RetrievalError::index_with_source("memory fts prepare", e))?;
            let mapper = |row: &rusqlite::Row<'_>| {
                let id: String = row.get(0)?;
                let text: String = row.get(1)?;
                Ok((id, text))
            };
            let mut out = Vec::new();
            let pairs: rusqlite::Result<Vec<(String, String)>> = match domain {
                Some(d) => stmt
                    .query_map(rusqlite::params![expr, k as i64, d], mapper)
                    .map_err(|e| RetrievalError::index_with_source("memory fts query", e))?
                    .collect(),
                None => stmt
                    .query_map(rusqlite::params![expr, k as i64], mapper)
                    .map_err(|e| RetrievalError::index_with_source("memory fts query", e))?
                    .collect(),
            };
            let pairs =
                pairs.map_err(|e| RetrievalError::index_with_source("memory fts row", e))?;
            for (id, text) in pairs {
                out.push(LexicalHit {
                    id,
                    snippet: snippet_of(&text),
                    why: "fts5 match".to_string(),
                    score: 1.0,
                    source: SourceType::Memory,
                    url: None,
                    title: None,
                    entities: Vec::new(),
                });
            }
            if !out.is_empty() {
                return Ok(out);
            }
        }
    }

    // Recency-bounded term overlap scan.
    let sql = match domain {
        Some(_) => "SELECT id, text FROM memory WHERE domain = ?2 ORDER BY ts DESC LIMIT ?1",
        None => "SELECT id, text FROM memory ORDER BY ts DESC LIMIT ?1",
    };
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| RetrievalError::index_with_source("memory scan prepare", e))?;
    let mapper = |row: &rusqlite::Row<'_>| {
        let id: String = row.get(0)?;
        let text: String = row.get(1)?;
        Ok((id, text))
    };
    let rows: Vec<rusqlite::Result<(String, String)>> = match domain {
        Some(d) => stmt
            .query_map(rusqlite::params![SCAN_WINDOW as i64, d], mapper)
            .map_err(|e| RetrievalError::index_with_source("memory scan query", e))?
            .collect(),
        None => stmt
            .query_map([SCAN_WINDOW as i64], mapper)
            .map_err(|e| RetrievalError::index_with_source("memory scan query", e))?
            .collect(),
    };
    let mut scored: Vec<(f64, LexicalHit)> = Vec::new();
    for row in rows {
        let (id, text) = row.map_err(|e| RetrievalError::index_with_source("memory scan row", e))?;
        let score = term_overlap(query, &text);
        if score > 0.0 {
            scored.push((
                score,
                LexicalHit {
                    id,
                    snippet: snippet_of(&text),
                    why: "term overlap".to_string(),
                    score,
                    source: SourceType::Memory,
                    url: None,
                    title: None,
                    entities: Vec::new(),
                },
            ));
        }
    }
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    Ok(scored.into_iter().take(k).map(|(_, h)| h).collect())
}

fn entities_from_meta(meta_json: Option<&str>) -> Vec<String> {
    let Some(raw) = meta_json else {
        return Vec::new();
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        return Vec::new();
    };
    match value.get("entities") {
        Some(serde_json::Value::String(s)) => s
            .split('|')
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .collect(),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn corpus_hit_from_row(
    id: String,
    text: String,
    title: Option<String>,
    url: Option<String>,
    meta_json: Option<String>,
    why: &str,
    score: f64,
) -> LexicalHit {
    LexicalHit {
        id,
        snippet: snippet_of(&text),
        why: why.to_string(),
        score,
        source: SourceType::Corpus,
        url,
        title,
        entities: entities_from_meta(meta_json.as_deref()),
    }
}

/// Search corpus documents.
pub fn search_corpus(conn: &Connection, query: &str, k: usize) -> Result<Vec<LexicalHit>> {
    if fts_table_exists(conn, "corpus_fts") {
        let expr = fts_match_expr(query);
        if !expr.is_empty() {
            let mut stmt = conn
                .prepare(
                    "SELECT c.id, c.text, c.title, c.url, c.meta_json FROM corpus_fts f \
                     JOIN corpus c ON c.id = f.id WHERE corpus_fts MATCH ?1 LIMIT ?2",
                )
                .map_err(|e| RetrievalError::index_with_source("corpus fts prepare", e))?;
            let rows = stmt
                .query_map(rusqlite::params![expr, k as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                })
                .map_err(|e| RetrievalError::index_with_source("corpus fts query", e))?;
            let mut out = Vec::new();
            for row in rows {
                let (id, text, title, url, meta) =
                    row.map_err(|e| RetrievalError::index_with_source("corpus fts row", e))?;
                out.push(corpus_hit_from_row(id, text, title, url, meta, "fts5 match", 1.0));
            }
            if !out.is_empty() {
                return Ok(out);
            }
        }
    }

    let mut stmt = conn
        .prepare("SELECT id, text, title, url, meta_json FROM corpus ORDER BY ts DESC LIMIT ?1")
        .map_err(|e| RetrievalError::index_with_source("corpus scan prepare", e))?;
    let rows = stmt
        .query_map([SCAN_WINDOW as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })
        .map_err(|e| RetrievalError::index_with_source("corpus scan query", e))?;
    let mut scored: Vec<(f64, LexicalHit)> = Vec::new();
    for row in rows {
        let (id, text, title, url, meta) =
            row.map_err(|e| RetrievalError::index_with_source("corpus scan row", e))?;
        let score = term_overlap(query, &text);
        if score > 0.0 {
            scored.push((
                score,
                corpus_hit_from_row(id, text, title, url, meta, "term overlap", score),
            ));
        }
    }
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    debug!(hits = scored.len(), "corpus scan fallback");
    Ok(scored.into_iter().take(k).map(|(_, h)| h).collect())
}

/// Fetch corpus documents by id, used to hydrate vector-backend hits.
pub fn fetch_docs_by_ids(conn: &Connection, ids: &[String]) -> Result<Vec<LexicalHit>> {
    let mut out = Vec::new();
    let mut stmt = conn
        .prepare("SELECT id, text, title, url, meta_json FROM corpus WHERE id = ?1")
        .map_err(|e| RetrievalError::index_with_source("corpus by-id prepare", e))?;
    for id in ids {
        let row = stmt.query_row([id.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        });
        match row {
            Ok((id, text, title, url, meta)) => {
                out.push(corpus_hit_from_row(id, text, title, url, meta, "vector match", 0.0));
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => continue,
            Err(e) => return Err(RetrievalError::index_with_source("corpus by-id row", e)),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "CREATE TABLE memory (id TEXT PRIMARY KEY, ts REAL, key TEXT, text TEXT, domain TEXT);
             CREATE TABLE corpus (id TEXT PRIMARY KEY, ts REAL, text TEXT, title TEXT, url TEXT, meta_json TEXT);
             INSERT INTO memory VALUES ('m1', 1.0, 'k1', 'The service uptime target is 99.9 percent', 'default');
             INSERT INTO memory VALUES ('m2', 2.0, 'k2', 'Lunch menu rotates weekly', 'default');
             INSERT INTO corpus VALUES ('c1', 1.0, 'Uptime is measured monthly across regions', 'SLO doc', 'https://docs.example.com/slo', '{\"entities\": \"uptime|slo\"}');",
        )
        .expect("seed schema");
        conn
    }

    #[test]
    fn test_search_memory_term_overlap() {
        let conn = seed_db();
        let hits = search_memory(&conn, "uptime target", 5, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "m1");
        assert_eq!(hits[0].why, "term overlap");
    }

    #[test]
    fn test_search_memory_domain_filter() {
        let conn = seed_db();
        let hits = search_memory(&conn, "uptime target", 5, Some("default")).unwrap();
        assert_eq!(hits.len(), 1);
        let hits = search_memory(&conn, "uptime target", 5, Some("clinical")).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_search_corpus_carries_url_and_entities() {
        let conn = seed_db();
        let hits = search_corpus(&conn, "uptime regions", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url.as_deref(), Some("https://docs.example.com/slo"));
        assert_eq!(hits[0].entities, vec!["uptime", "slo"]);
    }

    #[test]
    fn test_no_match_returns_empty() {
        let conn = seed_db();
        let hits = search_memory(&conn, "zebra quantum", 5, None).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_fetch_docs_by_ids_skips_missing() {
        let conn = seed_db();
        let docs =
            fetch_docs_by_ids(&conn, &["c1".to_string(), "missing".to_string()]).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "c1");
    }
}
