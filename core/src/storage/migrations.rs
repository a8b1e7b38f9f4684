//! Schema versioning and migrations
//!
//! Forward-only, idempotent, tracked through `PRAGMA user_version` and
//! applied inside one exclusive transaction at startup.

use rusqlite::{Connection, TransactionBehavior};
use tracing::{info, warn};

use crate::errors::{EngineError, Result};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// Apply all pending migrations.
pub fn migrate_to_latest(conn: &mut Connection) -> Result<()> {
    let current = schema_version(conn)?;
    if current == SCHEMA_VERSION {
        return Ok(());
    }
    if current > SCHEMA_VERSION {
        return Err(EngineError::resource(format!(
            "database schema version {current} is newer than application version {SCHEMA_VERSION}"
        )));
    }

    info!(from = current, to = SCHEMA_VERSION, "migrating schema");
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Exclusive)
        .map_err(|e| EngineError::resource_with_source("begin migration", e))?;
    for version in (current + 1)..=SCHEMA_VERSION {
        apply_migration(&tx, version)?;
    }
    tx.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
        .map_err(|e| EngineError::resource_with_source("set schema version", e))?;
    tx.commit()
        .map_err(|e| EngineError::resource_with_source("commit migration", e))?;
    info!(version = SCHEMA_VERSION, "schema migration complete");
    Ok(())
}

fn schema_version(conn: &Connection) -> Result<i32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| EngineError::resource_with_source("query schema version", e))
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migration_v1(conn),
        2 => migration_v2(conn),
        _ => Err(EngineError::resource(format!(
            "unknown migration version: {version}"
        ))),
    }
}

/// V1: index tables, workspace tables, audit log, required indices.
fn migration_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS workspaces (
            id TEXT PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            name TEXT,
            created REAL NOT NULL,
            root TEXT
        );

        CREATE TABLE IF NOT EXISTS workspace_policies (
            workspace_slug TEXT NOT NULL,
            key TEXT NOT NULL,
            value_json TEXT NOT NULL,
            updated REAL NOT NULL,
            PRIMARY KEY (workspace_slug, key)
        );

        CREATE TABLE IF NOT EXISTS cp_artifacts (
            id TEXT PRIMARY KEY,
            ts REAL NOT NULL,
            run_id TEXT NOT NULL,
            domain TEXT NOT NULL,
            S REAL NOT NULL,
            accepted INTEGER NOT NULL,
            correct INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cp_reference (
            domain TEXT PRIMARY KEY,
            run_id TEXT,
            target_mis REAL,
            tau REAL,
            stats_json TEXT,
            snne_quantiles TEXT,
            updated REAL
        );

        CREATE TABLE IF NOT EXISTS eval_runs (
            id TEXT PRIMARY KEY,
            ts REAL NOT NULL,
            suite TEXT,
            summary_json TEXT
        );

        CREATE TABLE IF NOT EXISTS memory (
            id TEXT PRIMARY KEY,
            ts REAL NOT NULL,
            key TEXT NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB,
            domain TEXT,
            recency REAL,
            tokens INTEGER,
            embedding_model TEXT
        );

        CREATE TABLE IF NOT EXISTS corpus (
            id TEXT PRIMARY KEY,
            ts REAL NOT NULL,
            text TEXT NOT NULL,
            title TEXT,
            url TEXT,
            meta_json TEXT
        );

        CREATE TABLE IF NOT EXISTS corpus_files (
            id TEXT PRIMARY KEY,
            path TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            ingested REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS steps (
            id TEXT PRIMARY KEY,
            ts REAL NOT NULL,
            request_id TEXT,
            step INTEGER NOT NULL DEFAULT 0,
            question TEXT NOT NULL,
            answer TEXT NOT NULL,
            domain TEXT,
            s1 REAL NOT NULL,
            s2 REAL NOT NULL,
            final_score REAL NOT NULL,
            cp_accept INTEGER,
            action TEXT NOT NULL,
            reason TEXT NOT NULL,
            is_refinement INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'ok',
            latency_ms INTEGER NOT NULL DEFAULT 0,
            usage_json TEXT,
            pack_ids_json TEXT,
            issues_json TEXT,
            tools_used_json TEXT,
            change_summary TEXT,
            trace_json TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_memory_key_ts ON memory(key, ts DESC);
        CREATE INDEX IF NOT EXISTS idx_memory_domain ON memory(domain);
        CREATE INDEX IF NOT EXISTS idx_cp_artifacts_run ON cp_artifacts(run_id);
        CREATE INDEX IF NOT EXISTS idx_cp_artifacts_domain ON cp_artifacts(domain);
        CREATE INDEX IF NOT EXISTS idx_steps_ts ON steps(ts DESC);
        CREATE INDEX IF NOT EXISTS idx_steps_domain ON steps(domain);
        CREATE INDEX IF NOT EXISTS idx_steps_request ON steps(request_id);
        ",
    )
    .map_err(|e| EngineError::resource_with_source("migration v1", e))?;
    info!("migration v1 complete: base tables and indices");
    Ok(())
}

/// V2: FTS5 shadow tables for memory and corpus, kept in sync by
/// triggers. Best-effort: an SQLite build without FTS5 still works, the
/// retriever falls back to term-overlap scans.
fn migration_v2(conn: &Connection) -> Result<()> {
    let fts = conn.execute_batch(
        "
        CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts USING fts5(id UNINDEXED, text);
        CREATE VIRTUAL TABLE IF NOT EXISTS corpus_fts USING fts5(id UNINDEXED, text);

        CREATE TRIGGER IF NOT EXISTS memory_fts_insert AFTER INSERT ON memory BEGIN
            INSERT INTO memory_fts (id, text) VALUES (new.id, new.text);
        END;
        CREATE TRIGGER IF NOT EXISTS memory_fts_delete AFTER DELETE ON memory BEGIN
            DELETE FROM memory_fts WHERE id = old.id;
        END;
        CREATE TRIGGER IF NOT EXISTS corpus_fts_insert AFTER INSERT ON corpus BEGIN
            INSERT INTO corpus_fts (id, text) VALUES (new.id, new.text);
        END;
        CREATE TRIGGER IF NOT EXISTS corpus_fts_delete AFTER DELETE ON corpus BEGIN
            DELETE FROM corpus_fts WHERE id = old.id;
        END;
        ",
    );
    if let Err(e) = fts {
        warn!(error = %e, "fts5 unavailable; lexical search will use scan fallback");
    } else {
        info!("migration v2 complete: fts5 shadow tables");
    }
    Ok(())
}
