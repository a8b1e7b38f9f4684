//! Calibration drift monitoring
//!
//! Two signals: SNNE quantile drift against the stored baseline, and
//! rolling false-accept rates that exceed the calibration target. Both
//! degrade to alerts; they never block requests.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::storage::cp::DomainStats;

/// Quantile deltas between a stored baseline and observed scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantileDrift {
    pub deltas: BTreeMap<String, f64>,
    pub max_abs_delta: f64,
    pub sample_size: usize,
}

/// Compare baseline quantiles with observed quantiles.
pub fn compute_quantile_drift(
    baseline: &BTreeMap<String, f64>,
    observed: &BTreeMap<String, f64>,
    sample_size: usize,
) -> QuantileDrift {
    let mut deltas = BTreeMap::new();
    let mut max_abs = 0.0f64;
    for (key, base_val) in baseline {
        if let Some(obs_val) = observed.get(key) {
            let delta = obs_val - base_val;
            max_abs = max_abs.max(delta.abs());
            deltas.insert(key.clone(), delta);
        }
    }
    QuantileDrift {
        deltas,
        max_abs_delta: max_abs,
        sample_size,
    }
}

/// Whether drift warrants an alert. Small samples never alert.
pub fn needs_attention(drift: &QuantileDrift, tolerance: f64, min_sample_size: usize) -> bool {
    if drift.sample_size < min_sample_size.max(1) {
        return false;
    }
    drift.max_abs_delta > tolerance
}

/// Per-domain false-accept alert payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FalseAcceptAlert {
    pub false_accept_rate: f64,
    pub target: f64,
    pub tolerance: f64,
}

/// Domains whose rolling false-accept rate exceeds target + tolerance.
pub fn false_accept_alerts(
    stats: &BTreeMap<String, DomainStats>,
    target: f64,
    tolerance: f64,
) -> BTreeMap<String, FalseAcceptAlert> {
    let mut alerts = BTreeMap::new();
    for (domain, s) in stats {
        if s.rate_false_accept > target + tolerance {
            alerts.insert(
                domain.clone(),
                FalseAcceptAlert {
                    false_accept_rate: s.rate_false_accept,
                    target,
                    tolerance,
                },
            );
        }
    }
    alerts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quantiles(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_drift_measures_max_delta() {
        let baseline = quantiles(&[("0.50", -4.0), ("0.90", -2.0)]);
        let observed = quantiles(&[("0.50", -4.1), ("0.90", -1.5)]);
        let drift = compute_quantile_drift(&baseline, &observed, 100);
        assert!((drift.max_abs_delta - 0.5).abs() < 1e-9);
        assert_eq!(drift.deltas.len(), 2);
    }

    #[test]
    fn test_small_samples_never_alert() {
        let baseline = quantiles(&[("0.50", -4.0)]);
        let observed = quantiles(&[("0.50", -1.0)]);
        let drift = compute_quantile_drift(&baseline, &observed, 3);
        assert!(!needs_attention(&drift, 0.08, 50));
        let drift = compute_quantile_drift(&baseline, &observed, 80);
        assert!(needs_attention(&drift, 0.08, 50));
    }

    #[test]
    fn test_false_accept_alerts_fire_above_tolerance() {
        let mut stats = BTreeMap::new();
        stats.insert(
            "default".to_string(),
            DomainStats {
                n: 100,
                accepted: 50,
                false_accept: 10,
                rate_accept: 0.5,
                rate_false_accept: 0.2,
            },
        );
        let alerts = false_accept_alerts(&stats, 0.05, 0.02);
        assert!(alerts.contains_key("default"));
        let alerts = false_accept_alerts(&stats, 0.25, 0.02);
        assert!(alerts.is_empty());
    }
}
