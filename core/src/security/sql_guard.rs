//! Read-only SQL guard for TABLE_QUERY
//!
//! Conservative by construction: single-statement SELECT only, no
//! comments, no statement stacking, and a blocked-keyword sweep that
//! covers DDL/DML, PRAGMA, ATTACH, UNION, and CTEs. The table extractor is
//! deliberately naive (FROM clauses only); anything it cannot resolve is
//! rejected against the allowlist.

use once_cell::sync::Lazy;
use regex_lite::Regex;

/// Why a statement was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlViolation {
    NotSelect,
    StatementStacking,
    Comment,
    ForbiddenConstruct,
    TableNotAllowed,
}

impl SqlViolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotSelect => "not_select",
            Self::StatementStacking => "statement_stacking",
            Self::Comment => "comment",
            Self::ForbiddenConstruct => "forbidden_construct",
            Self::TableNotAllowed => "table_not_allowed",
        }
    }
}

static SELECT_ONLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^\s*select\s").expect("select pattern"));
static BLOCKED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(insert|update|delete|drop|alter|create|attach|detach|pragma|with|union)\b",
    )
    .expect("blocked pattern")
});
static TABLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bfrom\s+([a-zA-Z_][a-zA-Z0-9_\.]*)").expect("table pattern")
});

/// Validate that `sql` is a single read-only SELECT.
pub fn check_read_only_select(sql: &str) -> std::result::Result<(), SqlViolation> {
    let s = sql.trim();
    if !SELECT_ONLY.is_match(s) {
        return Err(SqlViolation::NotSelect);
    }
    if s.contains(';') {
        return Err(SqlViolation::StatementStacking);
    }
    if s.contains("--") || s.contains("/*") || s.contains("*/") {
        return Err(SqlViolation::Comment);
    }
    if BLOCKED.is_match(s) {
        return Err(SqlViolation::ForbiddenConstruct);
    }
    Ok(())
}

/// Tables referenced in FROM clauses, first occurrence order.
pub fn referenced_tables(sql: &str) -> Vec<String> {
    TABLE_RE
        .captures_iter(sql)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_lowercase()))
        .collect()
}

/// Check that every referenced table is on the allowlist. An empty
/// allowlist allows nothing.
pub fn check_tables_allowed(
    sql: &str,
    allowed: &[String],
) -> std::result::Result<Vec<String>, SqlViolation> {
    let tables = referenced_tables(sql);
    if tables.is_empty() || allowed.is_empty() {
        return Err(SqlViolation::TableNotAllowed);
    }
    let allowed_lower: Vec<String> = allowed.iter().map(|t| t.to_lowercase()).collect();
    if tables.iter().all(|t| allowed_lower.contains(t)) {
        Ok(tables)
    } else {
        Err(SqlViolation::TableNotAllowed)
    }
}
