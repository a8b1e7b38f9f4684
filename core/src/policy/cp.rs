//! Conformal threshold table
//!
//! Per-domain tau values derived from calibration artifacts, cached in
//! memory and invalidated when new artifacts are imported. Domains with
//! too few artifacts get one advisory alert per process and fall back to
//! the static threshold.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tracing::warn;

use crate::config::Settings;
use crate::errors::Result;
use crate::storage::{cp as cp_store, DbPool};

/// A cached threshold lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdEntry {
    pub tau: Option<f64>,
    pub stats: cp_store::DomainStats,
    pub target_mis: f64,
}

/// Process-wide threshold cache keyed by domain.
#[derive(Debug, Default)]
pub struct ThresholdTable {
    cache: Mutex<HashMap<String, ThresholdEntry>>,
    alerted_domains: Mutex<HashSet<String>>,
}

impl ThresholdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up tau for a domain, computing and caching on miss.
    ///
    /// Returns `(entry, cached)`. Insufficient calibration data yields
    /// `tau: None` with a single advisory alert per domain.
    pub fn lookup(
        &self,
        pool: &DbPool,
        settings: &Settings,
        domain: &str,
    ) -> Result<(ThresholdEntry, bool)> {
        let domain_key = domain.to_lowercase();
        if let Ok(cache) = self.cache.lock() {
            if let Some(entry) = cache.get(&domain_key) {
                return Ok((entry.clone(), true));
            }
        }

        let conn = pool.get()?;
        let stats = cp_store::domain_stats(&conn, Some(&domain_key))?
            .remove(&domain_key)
            .unwrap_or_default();
        let tau = if stats.n >= settings.snne_drift_min_samples {
            cp_store::compute_threshold(
                &conn,
                &domain_key,
                settings.cp_target_mis,
                settings.cp_min_accepts,
            )?
        } else {
            self.advise_once(&domain_key, stats.n, settings.snne_drift_min_samples);
            None
        };

        let entry = ThresholdEntry {
            tau,
            stats,
            target_mis: settings.cp_target_mis,
        };
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(domain_key, entry.clone());
        }
        Ok((entry, false))
    }

    fn advise_once(&self, domain: &str, have: usize, need: usize) {
        if let Ok(mut alerted) = self.alerted_domains.lock() {
            if alerted.insert(domain.to_string()) {
                warn!(
                    domain,
                    have, need, "insufficient calibration artifacts, using static threshold"
                );
            }
        }
    }

    /// Drop the cached entry for a domain (all domains when `None`),
    /// forcing recomputation on next lookup. Called after artifact import.
    pub fn invalidate(&self, domain: Option<&str>) {
        if let Ok(mut cache) = self.cache.lock() {
            match domain {
                Some(d) => {
                    cache.remove(&d.to_lowercase());
                }
                None => cache.clear(),
            }
        }
    }
}
