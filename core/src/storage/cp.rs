//! Conformal calibration storage
//!
//! Append-only artifacts (score, accepted, correct) drive the bootstrap
//! threshold search: the smallest tau whose accepted set keeps the
//! false-accept rate at or below target. Reference rows persist tau plus
//! SNNE quantiles per domain for the uncertainty calibrator.

use std::collections::BTreeMap;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{EngineError, Result};
use crate::storage::now_epoch;

/// One calibration observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub score: f64,
    pub accepted: bool,
    pub correct: bool,
}

/// Per-domain acceptance statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainStats {
    pub n: usize,
    pub accepted: usize,
    pub false_accept: usize,
    pub rate_accept: f64,
    pub rate_false_accept: f64,
}

/// Stored reference row for one domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    pub domain: String,
    pub run_id: String,
    pub target_mis: f64,
    pub tau: Option<f64>,
    pub stats: DomainStats,
    /// Quantile key ("0.10") to raw SNNE value at that quantile.
    pub snne_quantiles: BTreeMap<String, f64>,
    pub updated: f64,
}

/// Append artifacts for a run. Returns the number of rows written.
pub fn add_artifacts(
    conn: &Connection,
    run_id: &str,
    domain: &str,
    items: &[Artifact],
) -> Result<usize> {
    let ts = now_epoch();
    let mut stmt = conn
        .prepare(
            "INSERT INTO cp_artifacts (id, ts, run_id, domain, S, accepted, correct)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .map_err(|e| EngineError::resource_with_source("prepare artifact insert", e))?;
    for item in items {
        stmt.execute(rusqlite::params![
            Uuid::new_v4().to_string(),
            ts,
            run_id,
            domain,
            item.score,
            item.accepted as i64,
            item.correct as i64,
        ])
        .map_err(|e| EngineError::resource_with_source("insert artifact", e))?;
    }
    Ok(items.len())
}

fn load_artifacts(conn: &Connection, domain: &str) -> Result<Vec<Artifact>> {
    let mut stmt = conn
        .prepare("SELECT S, accepted, correct FROM cp_artifacts WHERE domain=?1")
        .map_err(|e| EngineError::resource_with_source("prepare artifact load", e))?;
    let rows = stmt
        .query_map([domain], |row| {
            Ok(Artifact {
                score: row.get(0)?,
                accepted: row.get::<_, i64>(1)? != 0,
                correct: row.get::<_, i64>(2)? != 0,
            })
        })
        .map_err(|e| EngineError::resource_with_source("query artifacts", e))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| EngineError::resource_with_source("read artifact", e))?);
    }
    Ok(out)
}

/// Bootstrap threshold: smallest observed score tau such that, among
/// artifacts with `score >= tau`, the false-accept rate among accepted ones
/// stays at or below `target_mis`. `None` when data is insufficient.
///
/// Deterministic for a fixed artifact set, which makes repeated imports of
/// the same rows converge to the same tau.
pub fn compute_threshold(
    conn: &Connection,
    domain: &str,
    target_mis: f64,
    min_accepts: usize,
) -> Result<Option<f64>> {
    let data = load_artifacts(conn, domain)?;
    if data.is_empty() {
        return Ok(None);
    }
    let mut candidates: Vec<f64> = data.iter().map(|a| a.score).collect();
    candidates.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    candidates.dedup();

    let mut best: Option<f64> = None;
    for tau in candidates {
        let above: Vec<&Artifact> = data.iter().filter(|a| a.score >= tau).collect();
        if above.len() < min_accepts {
            continue;
        }
        let accepted = above.iter().filter(|a| a.accepted).count();
        if accepted == 0 {
            continue;
        }
        let false_accept = above.iter().filter(|a| a.accepted && !a.correct).count();
        let rate = false_accept as f64 / accepted as f64;
        if rate <= target_mis && best.map_or(true, |b| tau < b) {
            best = Some(tau);
        }
    }
    Ok(best)
}

/// Per-domain stats; all domains when `domain` is `None`.
pub fn domain_stats(
    conn: &Connection,
    domain: Option<&str>,
) -> Result<BTreeMap<String, DomainStats>> {
    let mut stmt = conn
        .prepare(match domain {
            Some(_) => "SELECT domain, accepted, correct FROM cp_artifacts WHERE domain=?1",
            None => "SELECT domain, accepted, correct FROM cp_artifacts",
        })
        .map_err(|e| EngineError::resource_with_source("prepare stats", e))?;
    let mapper = |row: &rusqlite::Row<'_>| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)? != 0,
            row.get::<_, i64>(2)? != 0,
        ))
    };
    let rows: Vec<(String, bool, bool)> = match domain {
        Some(d) => {
            let iter = stmt
                .query_map([d], mapper)
                .map_err(|e| EngineError::resource_with_source("query stats", e))?;
            iter.collect::<rusqlite::Result<_>>()
                .map_err(|e| EngineError::resource_with_source("read stats", e))?
        }
        None => {
            let iter = stmt
                .query_map([], mapper)
                .map_err(|e| EngineError::resource_with_source("query stats", e))?;
            iter.collect::<rusqlite::Result<_>>()
                .map_err(|e| EngineError::resource_with_source("read stats", e))?
        }
    };

    let mut stats: BTreeMap<String, DomainStats> = BTreeMap::new();
    for (d, accepted, correct) in rows {
        let entry = stats.entry(d).or_default();
        entry.n += 1;
        if accepted {
            entry.accepted += 1;
            if !correct {
                entry.false_accept += 1;
            }
        }
    }
    for entry in stats.values_mut() {
        let n = entry.n.max(1);
        entry.rate_accept = entry.accepted as f64 / n as f64;
        entry.rate_false_accept = if entry.accepted > 0 {
            entry.false_accept as f64 / entry.accepted as f64
        } else {
            0.0
        };
    }
    Ok(stats)
}

/// Quantiles over raw SNNE scores for the calibrator baseline.
pub fn quantiles_from_scores(scores: &[f64], buckets: &[f64]) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    if scores.is_empty() {
        return out;
    }
    let mut sorted: Vec<f64> = scores.iter().copied().filter(|s| s.is_finite()).collect();
    if sorted.is_empty() {
        return out;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    for q in buckets {
        let q = q.clamp(0.0, 1.0);
        let pos = q * (sorted.len() - 1) as f64;
        let lo = pos.floor() as usize;
        let hi = pos.ceil() as usize;
        let value = if lo == hi {
            sorted[lo]
        } else {
            let frac = pos - lo as f64;
            sorted[lo] * (1.0 - frac) + sorted[hi] * frac
        };
        out.insert(format!("{q:.2}"), value);
    }
    out
}

/// Upsert the per-domain reference row.
pub fn upsert_reference(conn: &Connection, reference: &Reference) -> Result<()> {
    conn.execute(
        "INSERT INTO cp_reference (domain, run_id, target_mis, tau, stats_json, snne_quantiles, updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(domain) DO UPDATE SET
           run_id=excluded.run_id,
           target_mis=excluded.target_mis,
           tau=excluded.tau,
           stats_json=excluded.stats_json,
           snne_quantiles=excluded.snne_quantiles,
           updated=excluded.updated",
        rusqlite::params![
            reference.domain,
            reference.run_id,
            reference.target_mis,
            reference.tau,
            serde_json::to_string(&reference.stats).unwrap_or_default(),
            serde_json::to_string(&reference.snne_quantiles).unwrap_or_default(),
            reference.updated,
        ],
    )
    .map_err(|e| EngineError::resource_with_source("upsert cp reference", e))?;
    Ok(())
}

/// Load the reference row for a domain.
pub fn get_reference(conn: &Connection, domain: &str) -> Result<Option<Reference>> {
    let mut stmt = conn
        .prepare(
            "SELECT domain, run_id, target_mis, tau, stats_json, snne_quantiles, updated
             FROM cp_reference WHERE domain=?1",
        )
        .map_err(|e| EngineError::resource_with_source("prepare reference", e))?;
    let result = stmt.query_row([domain], |row| {
        Ok(Reference {
            domain: row.get(0)?,
            run_id: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            target_mis: row.get::<_, Option<f64>>(2)?.unwrap_or(0.05),
            tau: row.get(3)?,
            stats: row
                .get::<_, Option<String>>(4)?
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
            snne_quantiles: row
                .get::<_, Option<String>>(5)?
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
            updated: row.get::<_, Option<f64>>(6)?.unwrap_or(0.0),
        })
    });
    match result {
        Ok(reference) => Ok(Some(reference)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(EngineError::resource_with_source("read reference", e)),
    }
}
