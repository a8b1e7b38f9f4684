//! Per-domain SNNE calibration
//!
//! Stored quantiles of raw SNNE scores map a new raw value to its
//! position in the calibration distribution. Confidence is one minus that
//! position: raw scores in the tight-agreement tail land near 1. Domains
//! without stored quantiles fall back to the logistic map.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::storage::{cp as cp_store, DbPool};
use crate::uq::snne;

struct CacheEntry {
    quantiles: BTreeMap<String, f64>,
    loaded_at: Instant,
}

/// Per-domain calibrator with a refresh-on-expiry quantile cache.
pub struct SnneCalibrator {
    pool: DbPool,
    refresh: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl SnneCalibrator {
    pub fn new(pool: DbPool) -> Self {
        Self::with_refresh(pool, Duration::from_secs(600))
    }

    pub fn with_refresh(pool: DbPool, refresh: Duration) -> Self {
        Self {
            pool,
            refresh,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Normalize a raw SNNE score for `domain` into confidence [0,1].
    pub fn normalize(&self, domain: &str, raw: f64) -> f64 {
        if !raw.is_finite() {
            return 0.0;
        }
        let quantiles = self.quantiles_for(domain);
        if quantiles.is_empty() {
            return snne::normalize(raw);
        }
        normalize_with_quantiles(&quantiles, raw)
    }

    fn quantiles_for(&self, domain: &str) -> BTreeMap<String, f64> {
        let key = domain.to_lowercase();
        if let Ok(cache) = self.cache.lock() {
            if let Some(entry) = cache.get(&key) {
                if entry.loaded_at.elapsed() < self.refresh {
                    return entry.quantiles.clone();
                }
            }
        }
        let quantiles = self.load_quantiles(&key);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                key,
                CacheEntry {
                    quantiles: quantiles.clone(),
                    loaded_at: Instant::now(),
                },
            );
        }
        quantiles
    }

    fn load_quantiles(&self, domain: &str) -> BTreeMap<String, f64> {
        let Ok(conn) = self.pool.get() else {
            return BTreeMap::new();
        };
        match cp_store::get_reference(&conn, domain) {
            Ok(Some(reference)) => reference.snne_quantiles,
            _ => BTreeMap::new(),
        }
    }
}

/// Interpolate `raw` against (value, cumulative-probability) pairs and
/// return `1 - position` as confidence.
pub fn normalize_with_quantiles(quantiles: &BTreeMap<String, f64>, raw: f64) -> f64 {
    // Keys are probabilities, values are raw scores; order by raw value.
    let mut points: Vec<(f64, f64)> = quantiles
        .iter()
        .filter_map(|(prob, value)| {
            let p: f64 = prob.parse().ok()?;
            value.is_finite().then_some((*value, p.clamp(0.0, 1.0)))
        })
        .collect();
    if points.is_empty() {
        return snne::normalize(raw);
    }
    points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    // All quantile values identical: use the mean probability.
    if (points[points.len() - 1].0 - points[0].0).abs() < 1e-12 {
        let mean: f64 = points.iter().map(|(_, p)| p).sum::<f64>() / points.len() as f64;
        return (1.0 - mean).clamp(0.0, 1.0);
    }

    let position = if raw <= points[0].0 {
        0.0
    } else if raw >= points[points.len() - 1].0 {
        1.0
    } else {
        let mut pos = points[points.len() - 1].1;
        for window in points.windows(2) {
            let (v0, p0) = window[0];
            let (v1, p1) = window[1];
            if raw >= v0 && raw <= v1 {
                let frac = if (v1 - v0).abs() < 1e-12 {
                    0.0
                } else {
                    (raw - v0) / (v1 - v0)
                };
                pos = p0 + frac * (p1 - p0);
                break;
            }
        }
        pos
    };
    (1.0 - position).clamp(0.0, 1.0)
}
