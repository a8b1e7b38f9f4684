//! Step audit records
//!
//! Exactly one row per decided step. Question/answer text arrives here
//! already redacted (see `audit`); this module never sees raw input.

use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use attest_protocol::Action;

use crate::errors::{EngineError, Result};
use crate::storage::now_epoch;

/// Persisted audit record for one decision cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: String,
    pub ts: f64,
    pub request_id: String,
    pub step: usize,
    /// Redacted question text.
    pub question: String,
    /// Redacted answer text.
    pub answer: String,
    pub domain: String,
    pub s1: f64,
    pub s2: f64,
    pub final_score: f64,
    pub cp_accept: Option<bool>,
    pub action: Action,
    pub reason: String,
    pub is_refinement: bool,
    /// "ok" | "incomplete" | "error"
    pub status: String,
    pub latency_ms: u64,
    pub usage_json: Option<String>,
    pub pack_ids: Vec<String>,
    pub issues: Vec<String>,
    pub tools_used: Vec<String>,
    pub change_summary: Option<String>,
    pub trace_json: Option<String>,
}

/// Insert one step row and return its id.
pub fn insert_step(conn: &Connection, record: &StepRecord) -> Result<String> {
    let id = if record.id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        record.id.clone()
    };
    let ts = if record.ts > 0.0 { record.ts } else { now_epoch() };
    conn.execute(
        "INSERT INTO steps (
            id, ts, request_id, step, question, answer, domain, s1, s2, final_score,
            cp_accept, action, reason, is_refinement, status, latency_ms,
            usage_json, pack_ids_json, issues_json, tools_used_json, change_summary, trace_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
        rusqlite::params![
            id,
            ts,
            record.request_id,
            record.step as i64,
            record.question,
            record.answer,
            record.domain,
            record.s1,
            record.s2,
            record.final_score,
            record.cp_accept.map(i64::from),
            record.action.as_str(),
            record.reason,
            record.is_refinement as i64,
            record.status,
            record.latency_ms as i64,
            record.usage_json,
            serde_json::to_string(&record.pack_ids).unwrap_or_default(),
            serde_json::to_string(&record.issues).unwrap_or_default(),
            serde_json::to_string(&record.tools_used).unwrap_or_default(),
            record.change_summary,
            record.trace_json,
        ],
    )
    .map_err(|e| EngineError::resource_with_source("insert step", e))?;
    Ok(id)
}

fn parse_action(raw: &str) -> Action {
    match raw {
        "accept" => Action::Accept,
        "iterate" => Action::Iterate,
        _ => Action::Abstain,
    }
}

fn json_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default()
}

fn record_from_row(row: &Row<'_>, include_trace: bool) -> rusqlite::Result<StepRecord> {
    Ok(StepRecord {
        id: row.get("id")?,
        ts: row.get("ts")?,
        request_id: row.get::<_, Option<String>>("request_id")?.unwrap_or_default(),
        step: row.get::<_, i64>("step")? as usize,
        question: row.get("question")?,
        answer: row.get("answer")?,
        domain: row.get::<_, Option<String>>("domain")?.unwrap_or_default(),
        s1: row.get("s1")?,
        s2: row.get("s2")?,
        final_score: row.get("final_score")?,
        cp_accept: row.get::<_, Option<i64>>("cp_accept")?.map(|v| v != 0),
        action: parse_action(&row.get::<_, String>("action")?),
        reason: row.get("reason")?,
        is_refinement: row.get::<_, i64>("is_refinement")? != 0,
        status: row.get("status")?,
        latency_ms: row.get::<_, i64>("latency_ms")? as u64,
        usage_json: row.get("usage_json")?,
        pack_ids: json_list(row.get("pack_ids_json")?),
        issues: json_list(row.get("issues_json")?),
        tools_used: json_list(row.get("tools_used_json")?),
        change_summary: row.get("change_summary")?,
        trace_json: if include_trace {
            row.get("trace_json")?
        } else {
            None
        },
    })
}

/// Filters for the recent-steps listing.
#[derive(Debug, Clone, Default)]
pub struct StepFilter {
    pub limit: usize,
    pub domain: Option<String>,
    pub action: Option<Action>,
    pub include_trace: bool,
}

/// List steps ordered by timestamp descending.
pub fn recent_steps(conn: &Connection, filter: &StepFilter) -> Result<Vec<StepRecord>> {
    let limit = if filter.limit == 0 { 50 } else { filter.limit.min(500) };
    let mut sql = String::from("SELECT * FROM steps WHERE 1=1");
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(domain) = &filter.domain {
        sql.push_str(" AND domain = ?");
        params.push(Box::new(domain.clone()));
    }
    if let Some(action) = filter.action {
        sql.push_str(" AND action = ?");
        params.push(Box::new(action.as_str().to_string()));
    }
    sql.push_str(" ORDER BY ts DESC LIMIT ?");
    params.push(Box::new(limit as i64));

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| EngineError::resource_with_source("prepare recent steps", e))?;
    let include_trace = filter.include_trace;
    let rows = stmt
        .query_map(
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            |row| record_from_row(row, include_trace),
        )
        .map_err(|e| EngineError::resource_with_source("query recent steps", e))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| EngineError::resource_with_source("read step row", e))?);
    }
    Ok(out)
}

/// Fetch one step by id, trace included.
pub fn get_step(conn: &Connection, id: &str) -> Result<Option<StepRecord>> {
    let mut stmt = conn
        .prepare("SELECT * FROM steps WHERE id = ?1")
        .map_err(|e| EngineError::resource_with_source("prepare step detail", e))?;
    match stmt.query_row([id], |row| record_from_row(row, true)) {
        Ok(record) => Ok(Some(record)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(EngineError::resource_with_source("read step detail", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_pool;

    fn sample(step: usize, action: Action, domain: &str) -> StepRecord {
        StepRecord {
            id: String::new(),
            ts: 0.0,
            request_id: "req-1".to_string(),
            step,
            question: "what is the uptime target".to_string(),
            answer: "99.9 percent".to_string(),
            domain: domain.to_string(),
            s1: 0.8,
            s2: 0.7,
            final_score: 0.75,
            cp_accept: Some(true),
            action,
            reason: "initial".to_string(),
            is_refinement: step > 0,
            status: "ok".to_string(),
            latency_ms: 12,
            usage_json: None,
            pack_ids: vec!["c1".to_string()],
            issues: vec!["missing_citations".to_string()],
            tools_used: vec!["MATH_EVAL".to_string()],
            change_summary: None,
            trace_json: Some("{\"tools\":[]}".to_string()),
        }
    }

    #[test]
    fn test_insert_and_fetch_roundtrip() {
        let pool = test_pool();
        let conn = pool.get().unwrap();
        let id = insert_step(&conn, &sample(0, Action::Accept, "default")).unwrap();
        let fetched = get_step(&conn, &id).unwrap().expect("step exists");
        assert_eq!(fetched.pack_ids, vec!["c1"]);
        assert_eq!(fetched.issues, vec!["missing_citations"]);
        assert_eq!(fetched.action, Action::Accept);
        assert!(fetched.trace_json.is_some());
    }

    #[test]
    fn test_recent_steps_filters_by_action_and_domain() {
        let pool = test_pool();
        let conn = pool.get().unwrap();
        insert_step(&conn, &sample(0, Action::Accept, "default")).unwrap();
        insert_step(&conn, &sample(0, Action::Abstain, "default")).unwrap();
        insert_step(&conn, &sample(0, Action::Accept, "clinical")).unwrap();

        let filter = StepFilter {
            limit: 10,
            domain: Some("default".to_string()),
            action: Some(Action::Accept),
            include_trace: false,
        };
        let rows = recent_steps(&conn, &filter).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].domain, "default");
        assert!(rows[0].trace_json.is_none());
    }
}
