//! Decision head: score combination and accept/iterate/abstain policy
//!
//! `S = w1*s1 + w2*s2`, compared against the per-domain conformal
//! threshold (when calibrated) and the static accept threshold. The
//! borderline band below the accept threshold admits refinement only when
//! budget remains and at least one issue is fixable.

pub mod cp;
pub mod drift;
pub mod overlay;

use serde::{Deserialize, Serialize};

use attest_protocol::{Action, Issue};

/// Static decision parameters after overlays are applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecisionConfig {
    pub w1: f64,
    pub w2: f64,
    pub tau_accept: f64,
    pub delta: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            w1: 0.5,
            w2: 0.5,
            tau_accept: 0.85,
            delta: 0.05,
        }
    }
}

/// Combined final score.
pub fn final_score(s1: f64, s2: f64, cfg: &DecisionConfig) -> f64 {
    (cfg.w1 * s1 + cfg.w2 * s2).clamp(0.0, 1.0)
}

/// Outcome of one decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub reason: String,
    pub cp_accept: Option<bool>,
    pub cp_tau: Option<f64>,
}

/// Decide the action for score `S`.
///
/// `cp_accept` is `None` when no conformal threshold exists for the
/// domain; the static threshold then decides alone. `refinements_left`
/// and the fixability of current issues gate the borderline iterate.
pub fn decide(
    score: f64,
    cfg: &DecisionConfig,
    cp_accept: Option<bool>,
    cp_tau: Option<f64>,
    refinements_left: bool,
    issues: &[Issue],
) -> Decision {
    let fixable = issues.iter().any(|i| i.kind.fixable());
    if score >= cfg.tau_accept && cp_accept != Some(false) {
        return Decision {
            action: Action::Accept,
            reason: match cp_accept {
                Some(true) => "above threshold, conformal gate passed".to_string(),
                _ => "above static threshold".to_string(),
            },
            cp_accept,
            cp_tau,
        };
    }
    let borderline = score >= cfg.tau_accept - cfg.delta;
    if borderline && refinements_left && fixable {
        return Decision {
            action: Action::Iterate,
            reason: "borderline with fixable issues".to_string(),
            cp_accept,
            cp_tau,
        };
    }
    Decision {
        action: Action::Abstain,
        reason: if borderline {
            "borderline without fixable issues or budget".to_string()
        } else if cp_accept == Some(false) && score >= cfg.tau_accept {
            "conformal gate rejected".to_string()
        } else {
            "below threshold".to_string()
        },
        cp_accept,
        cp_tau,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attest_protocol::IssueKind;

    fn cfg(tau: f64, delta: f64) -> DecisionConfig {
        DecisionConfig {
            tau_accept: tau,
            delta,
            ..Default::default()
        }
    }

    fn fixable() -> Vec<Issue> {
        vec![Issue::new(IssueKind::MissingCitations)]
    }

    #[test]
    fn test_final_score_weighted_mean() {
        let cfg = DecisionConfig::default();
        assert!((final_score(0.9, 0.9, &cfg) - 0.9).abs() < 1e-9);
        assert!((final_score(1.0, 0.0, &cfg) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_accept_requires_cp_when_present() {
        let d = decide(0.9, &cfg(0.7, 0.1), Some(true), Some(0.7), true, &[]);
        assert_eq!(d.action, Action::Accept);

        let d = decide(0.9, &cfg(0.7, 0.1), Some(false), Some(0.95), true, &fixable());
        assert_ne!(d.action, Action::Accept);
    }

    #[test]
    fn test_static_threshold_decides_without_tau() {
        let d = decide(0.9, &cfg(0.85, 0.05), None, None, false, &[]);
        assert_eq!(d.action, Action::Accept);
        assert_eq!(d.cp_accept, None);
    }

    #[test]
    fn test_borderline_iterates_only_with_fixable_issue() {
        let c = cfg(0.65, 0.1);
        let d = decide(0.6, &c, None, None, true, &fixable());
        assert_eq!(d.action, Action::Iterate);

        let d = decide(0.6, &c, None, None, true, &[Issue::new(IssueKind::ApprovalDenied)]);
        assert_eq!(d.action, Action::Abstain);

        let d = decide(0.6, &c, None, None, false, &fixable());
        assert_eq!(d.action, Action::Abstain);
    }

    #[test]
    fn test_far_below_band_abstains() {
        let d = decide(0.2, &cfg(0.85, 0.05), None, None, true, &fixable());
        assert_eq!(d.action, Action::Abstain);
    }
}
