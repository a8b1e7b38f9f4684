//! TABLE_QUERY tool
//!
//! Guarded, read-only SELECT over the workspace database: SQL guard,
//! table allowlist, per-table rate limit, row cap, and a progress-handler
//! time limit. Column property checks from policy are evaluated on the
//! result and surfaced alongside the rows.

use std::collections::HashMap;
use std::time::Instant;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use super::{TableRateLimiter, ToolError, ToolErrorKind};
use crate::config::ColumnPolicy;
use crate::pcn::checks;
use crate::security::sql_guard::{self, SqlViolation};

/// One result cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Integer(i64),
    Real(f64),
    Text(String),
    Null,
}

impl SqlValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Real(r) => Some(*r),
            _ => None,
        }
    }
}

/// Query result with policy check outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    /// Violation codes from per-column policy checks.
    pub policy_checks: Vec<String>,
}

impl TableResult {
    /// First numeric cell in row order, used for PCN minting.
    pub fn first_numeric(&self) -> Option<f64> {
        self.rows
            .iter()
            .flat_map(|row| row.iter())
            .find_map(SqlValue::as_f64)
    }

    /// Compact preview of the first rows for refinement context.
    pub fn summary(&self, max_rows: usize) -> String {
        if self.rows.is_empty() {
            return "no rows returned".to_string();
        }
        self.rows
            .iter()
            .take(max_rows)
            .map(|row| {
                row.iter()
                    .map(|v| match v {
                        SqlValue::Integer(i) => i.to_string(),
                        SqlValue::Real(r) => r.to_string(),
                        SqlValue::Text(t) => t.clone(),
                        SqlValue::Null => "null".to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" | ")
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

fn violation_error(violation: SqlViolation) -> ToolError {
    let kind = match violation {
        SqlViolation::NotSelect => ToolErrorKind::NotSelect,
        SqlViolation::TableNotAllowed => ToolErrorKind::TableNotAllowed,
        _ => ToolErrorKind::ForbiddenConstruct,
    };
    ToolError::new(kind, violation.as_str().to_string())
}

/// Execution limits and policy for one query.
#[derive(Debug, Clone)]
pub struct QueryLimits<'a> {
    pub max_rows: usize,
    pub time_limit_ms: u64,
    pub rate_limit_per_minute: u32,
    pub table_allowed: &'a [String],
    pub table_policies: &'a HashMap<String, HashMap<String, ColumnPolicy>>,
}

/// Run a guarded SELECT.
pub fn query(
    conn: &Connection,
    sql: &str,
    params: &[SqlValue],
    limits: &QueryLimits<'_>,
    limiter: &TableRateLimiter,
) -> Result<TableResult, ToolError> {
    sql_guard::check_read_only_select(sql).map_err(violation_error)?;
    let tables = sql_guard::check_tables_allowed(sql, limits.table_allowed).map_err(violation_error)?;

    for table in &tables {
        if !limiter.try_acquire(table, limits.rate_limit_per_minute) {
            return Err(ToolError::new(
                ToolErrorKind::RateLimited,
                format!("rate limit exceeded for table {table}"),
            ));
        }
    }

    // Abort long scans from the progress handler.
    let deadline = Instant::now() + std::time::Duration::from_millis(limits.time_limit_ms.max(1));
    conn.progress_handler(1000, Some(move || Instant::now() > deadline));

    let result = execute_select(conn, sql, params, limits);
    conn.progress_handler(0, None::<fn() -> bool>);
    let (columns, rows) = result?;

    let mut policy_checks = Vec::new();
    for table in &tables {
        if let Some(policies) = limits.table_policies.get(table) {
            policy_checks.extend(checks::evaluate_checks(&columns, &rows, policies));
        }
    }

    Ok(TableResult {
        columns,
        rows,
        policy_checks,
    })
}

fn execute_select(
    conn: &Connection,
    sql: &str,
    params: &[SqlValue],
    limits: &QueryLimits<'_>,
) -> Result<(Vec<String>, Vec<Vec<SqlValue>>), ToolError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| ToolError::new(ToolErrorKind::ParseError, format!("prepare: {e}")))?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let column_count = columns.len();

    let bound: Vec<Box<dyn rusqlite::ToSql>> = params
        .iter()
        .map(|p| -> Box<dyn rusqlite::ToSql> {
            match p {
                SqlValue::Integer(i) => Box::new(*i),
                SqlValue::Real(r) => Box::new(*r),
                SqlValue::Text(t) => Box::new(t.clone()),
                SqlValue::Null => Box::new(rusqlite::types::Null),
            }
        })
        .collect();

    let mut rows_iter = stmt
        .query(rusqlite::params_from_iter(bound.iter().map(|b| b.as_ref())))
        .map_err(|e| map_exec_error(e))?;

    let mut rows: Vec<Vec<SqlValue>> = Vec::new();
    loop {
        let row = match rows_iter.next() {
            Ok(Some(row)) => row,
            Ok(None) => break,
            Err(e) => return Err(map_exec_error(e)),
        };
        if rows.len() >= limits.max_rows {
            return Err(ToolError::new(
                ToolErrorKind::RowLimitExceeded,
                format!("result exceeds {} rows", limits.max_rows),
            ));
        }
        let mut cells = Vec::with_capacity(column_count);
        for idx in 0..column_count {
            let value = row
                .get_ref(idx)
                .map_err(|e| ToolError::new(ToolErrorKind::Internal, e.to_string()))?;
            cells.push(match value {
                rusqlite::types::ValueRef::Null => SqlValue::Null,
                rusqlite::types::ValueRef::Integer(i) => SqlValue::Integer(i),
                rusqlite::types::ValueRef::Real(r) => SqlValue::Real(r),
                rusqlite::types::ValueRef::Text(t) => {
                    SqlValue::Text(String::from_utf8_lossy(t).into_owned())
                }
                rusqlite::types::ValueRef::Blob(_) => SqlValue::Null,
            });
        }
        rows.push(cells);
    }
    Ok((columns, rows))
}

fn map_exec_error(e: rusqlite::Error) -> ToolError {
    match &e {
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::OperationInterrupted =>
        {
            ToolError::new(ToolErrorKind::Timeout, "query time limit exceeded")
        }
        _ => ToolError::new(ToolErrorKind::Internal, e.to_string()),
    }
}
