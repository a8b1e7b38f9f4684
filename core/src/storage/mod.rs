//! SQLite storage layer
//!
//! One shared database holds the index tables (workspaces, policies,
//! calibration) and the workspace tables (memory, corpus, steps). Writers
//! serialize through the pool with WAL mode; readers run concurrently.
//! Migrations run exclusively at startup.

pub mod corpus;
pub mod cp;
pub mod memory;
pub mod migrations;
pub mod steps;
pub mod ttl;
pub mod workspaces;

use std::path::Path;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::errors::{EngineError, Result};

/// Pooled connection handle.
pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = r2d2::PooledConnection<SqliteConnectionManager>;

fn apply_pragmas(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_millis(5000))?;
    Ok(())
}

/// Initialize the connection pool and run migrations to the latest
/// schema version. Must complete before the first request is accepted.
pub fn initialize_pool(db_path: &Path, pool_size: u32) -> Result<DbPool> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::resource_with_source("create db dir", e))?;
        }
    }
    let manager = SqliteConnectionManager::file(db_path).with_init(apply_pragmas);
    let pool = Pool::builder()
        .max_size(pool_size.max(1))
        .build(manager)
        .map_err(|e| EngineError::resource_with_source("build pool", e))?;
    {
        let mut conn = pool.get()?;
        migrations::migrate_to_latest(&mut conn)?;
    }
    Ok(pool)
}

/// Epoch seconds as f64, the timestamp convention for every table.
pub fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
pub(crate) fn test_pool() -> DbPool {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("attest-test.sqlite");
    // Leak the tempdir so the file outlives the pool in tests.
    std::mem::forget(dir);
    initialize_pool(&path, 4).expect("test pool")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_initializes_and_migrates() {
        let pool = test_pool();
        let conn = pool.get().unwrap();
        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, migrations::SCHEMA_VERSION);
    }

    #[test]
    fn test_foreign_keys_enabled() {
        let pool = test_pool();
        let conn = pool.get().unwrap();
        let fk: i32 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }
}
