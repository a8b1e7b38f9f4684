//! Per-column property checks on TABLE_QUERY results
//!
//! Violations use the pattern `col:<name>:<check>` and surface through
//! the tool's policy_checks list.

use std::collections::HashMap;

use crate::config::ColumnPolicy;
use crate::tools::table_query::SqlValue;

fn as_f64(value: &SqlValue) -> Option<f64> {
    match value {
        SqlValue::Integer(i) => Some(*i as f64),
        SqlValue::Real(r) => Some(*r),
        SqlValue::Text(t) => t.parse().ok(),
        SqlValue::Null => None,
    }
}

/// Evaluate column policies against result rows. `columns` gives the
/// result column order used to index into each row.
pub fn evaluate_checks(
    columns: &[String],
    rows: &[Vec<SqlValue>],
    policies: &HashMap<String, ColumnPolicy>,
) -> Vec<String> {
    let mut violations = Vec::new();
    if rows.is_empty() || policies.is_empty() {
        return violations;
    }
    for (col, policy) in policies {
        let Some(idx) = columns.iter().position(|c| c.eq_ignore_ascii_case(col)) else {
            continue;
        };
        let values: Vec<Option<f64>> = rows.iter().map(|r| r.get(idx).and_then(as_f64)).collect();

        if policy.non_negative && values.iter().flatten().any(|v| *v < 0.0) {
            violations.push(format!("col:{col}:nonnegative"));
        }
        if let Some(min) = policy.min {
            if values.iter().flatten().any(|v| *v < min) {
                violations.push(format!("col:{col}:min"));
            }
        }
        if let Some(max) = policy.max {
            if values.iter().flatten().any(|v| *v > max) {
                violations.push(format!("col:{col}:max"));
            }
        }
        if let Some(mode) = &policy.monotonic {
            let sequence: Vec<f64> = values.iter().flatten().copied().collect();
            let ok = sequence.windows(2).all(|w| match mode.as_str() {
                "increasing" => w[1] > w[0],
                "decreasing" => w[1] < w[0],
                "nondecreasing" => w[1] >= w[0],
                "nonincreasing" => w[1] <= w[0],
                _ => true,
            });
            if !ok {
                violations.push(format!("col:{col}:monotonic"));
            }
        }
    }
    violations.sort();
    violations
}
