//! Memory table writes
//!
//! Reads happen through `attest-retrieval`; this module owns inserts and
//! keeps token counts populated for budget accounting.

use rusqlite::Connection;
use uuid::Uuid;

use crate::errors::{EngineError, Result};
use crate::storage::now_epoch;

/// Insert one memory row and return its id. FTS sync is handled by the
/// schema triggers when FTS5 is available.
pub fn add_memory(
    conn: &Connection,
    key: &str,
    text: &str,
    domain: &str,
    embedding: Option<&[u8]>,
    embedding_model: Option<&str>,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let ts = now_epoch();
    let tokens = text.split_whitespace().count() as i64;
    conn.execute(
        "INSERT INTO memory (id, ts, key, text, embedding, domain, recency, tokens, embedding_model)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![id, ts, key, text, embedding, domain, ts, tokens, embedding_model],
    )
    .map_err(|e| EngineError::resource_with_source("insert memory", e))?;
    Ok(id)
}
