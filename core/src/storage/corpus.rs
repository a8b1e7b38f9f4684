//! Corpus table writes

use rusqlite::Connection;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::errors::{EngineError, Result};
use crate::storage::now_epoch;

/// Insert one corpus document and return its id.
pub fn add_doc(
    conn: &Connection,
    text: &str,
    title: Option<&str>,
    url: Option<&str>,
    meta_json: Option<&str>,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO corpus (id, ts, text, title, url, meta_json) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![id, now_epoch(), text, title, url, meta_json],
    )
    .map_err(|e| EngineError::resource_with_source("insert corpus doc", e))?;
    Ok(id)
}

/// Record an ingested source file so re-ingestion can skip unchanged
/// content.
pub fn record_file(conn: &Connection, path: &str, content: &[u8]) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let digest = format!("{:x}", hasher.finalize());
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO corpus_files (id, path, sha256, ingested) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![id, path, digest, now_epoch()],
    )
    .map_err(|e| EngineError::resource_with_source("insert corpus file", e))?;
    Ok(digest)
}

/// True when a file with identical content has already been ingested.
pub fn file_already_ingested(conn: &Connection, path: &str, content: &[u8]) -> Result<bool> {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let digest = format!("{:x}", hasher.finalize());
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM corpus_files WHERE path=?1 AND sha256=?2",
            rusqlite::params![path, digest],
            |row| row.get(0),
        )
        .map_err(|e| EngineError::resource_with_source("query corpus files", e))?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_pool;

    #[test]
    fn test_add_doc_and_file_tracking() {
        let pool = test_pool();
        let conn = pool.get().unwrap();
        add_doc(&conn, "body text", Some("Title"), None, None).unwrap();
        assert!(!file_already_ingested(&conn, "a.md", b"body").unwrap());
        record_file(&conn, "a.md", b"body").unwrap();
        assert!(file_already_ingested(&conn, "a.md", b"body").unwrap());
        assert!(!file_already_ingested(&conn, "a.md", b"changed").unwrap());
    }
}
