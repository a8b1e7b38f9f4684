//! Workspace records and policy overlay rows
//!
//! Provisioning and key issuance live outside the engine; this module
//! only reads workspace identity and the validated key-value overlay
//! applied per request.

use std::collections::HashMap;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{EngineError, Result};
use crate::storage::now_epoch;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub slug: String,
    pub name: Option<String>,
    pub created: f64,
    pub root: Option<String>,
}

/// Fetch a workspace by slug.
pub fn get_workspace(conn: &Connection, slug: &str) -> Result<Option<Workspace>> {
    let mut stmt = conn
        .prepare("SELECT id, slug, name, created, root FROM workspaces WHERE slug=?1")
        .map_err(|e| EngineError::resource_with_source("prepare workspace", e))?;
    match stmt.query_row([slug], |row| {
        Ok(Workspace {
            id: row.get(0)?,
            slug: row.get(1)?,
            name: row.get(2)?,
            created: row.get(3)?,
            root: row.get(4)?,
        })
    }) {
        Ok(ws) => Ok(Some(ws)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(EngineError::resource_with_source("read workspace", e)),
    }
}

/// Create the workspace row if missing; returns the record either way.
pub fn ensure_workspace(conn: &Connection, slug: &str, name: Option<&str>) -> Result<Workspace> {
    if let Some(existing) = get_workspace(conn, slug)? {
        return Ok(existing);
    }
    let ws = Workspace {
        id: Uuid::new_v4().to_string(),
        slug: slug.to_string(),
        name: name.map(str::to_string),
        created: now_epoch(),
        root: None,
    };
    conn.execute(
        "INSERT INTO workspaces (id, slug, name, created, root) VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![ws.id, ws.slug, ws.name, ws.created, ws.root],
    )
    .map_err(|e| EngineError::resource_with_source("insert workspace", e))?;
    Ok(ws)
}

/// Store one overlay key for a workspace. Key validation happens in
/// `policy::overlay` before this is called.
pub fn set_policy_value(
    conn: &Connection,
    slug: &str,
    key: &str,
    value: &serde_json::Value,
) -> Result<()> {
    conn.execute(
        "INSERT INTO workspace_policies (workspace_slug, key, value_json, updated)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(workspace_slug, key) DO UPDATE SET
           value_json=excluded.value_json, updated=excluded.updated",
        rusqlite::params![slug, key, value.to_string(), now_epoch()],
    )
    .map_err(|e| EngineError::resource_with_source("upsert policy value", e))?;
    Ok(())
}

/// Load the raw overlay map for a workspace.
pub fn load_policy_values(
    conn: &Connection,
    slug: &str,
) -> Result<HashMap<String, serde_json::Value>> {
    let mut stmt = conn
        .prepare("SELECT key, value_json FROM workspace_policies WHERE workspace_slug=?1")
        .map_err(|e| EngineError::resource_with_source("prepare policy load", e))?;
    let rows = stmt
        .query_map([slug], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(|e| EngineError::resource_with_source("query policy values", e))?;
    let mut out = HashMap::new();
    for row in rows {
        let (key, raw) = row.map_err(|e| EngineError::resource_with_source("read policy row", e))?;
        if let Ok(value) = serde_json::from_str(&raw) {
            out.insert(key, value);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_pool;

    #[test]
    fn test_ensure_workspace_idempotent() {
        let pool = test_pool();
        let conn = pool.get().unwrap();
        let a = ensure_workspace(&conn, "default", Some("Default")).unwrap();
        let b = ensure_workspace(&conn, "default", None).unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_policy_values_roundtrip() {
        let pool = test_pool();
        let conn = pool.get().unwrap();
        ensure_workspace(&conn, "ws", None).unwrap();
        set_policy_value(&conn, "ws", "accept_threshold", &serde_json::json!(0.7)).unwrap();
        set_policy_value(
            &conn,
            "ws",
            "tools_allowed",
            &serde_json::json!(["MATH_EVAL"]),
        )
        .unwrap();
        let values = load_policy_values(&conn, "ws").unwrap();
        assert_eq!(values["accept_threshold"], serde_json::json!(0.7));
        assert_eq!(values["tools_allowed"][0], "MATH_EVAL");
    }
}
