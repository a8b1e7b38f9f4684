//! Layered engine configuration
//!
//! Precedence: hardcoded defaults, then a TOML settings file, then
//! `ATTEST_*` environment overrides for the deployment-critical knobs.
//! Workspace policy overlays and per-request overrides are applied later,
//! at request time (see `policy::overlay`).

use std::collections::HashMap;
use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, Result};

/// Per-column property checks for TABLE_QUERY results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnPolicy {
    #[serde(default)]
    pub non_negative: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// "increasing" | "decreasing" | "nondecreasing" | "nonincreasing"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monotonic: Option<String>,
}

/// Engine settings. Every field has a sensible default so an empty file
/// (or no file) yields a working offline engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Shared SQLite database path (index + workspace tables).
    pub db_path: String,

    // Scoring / decision
    pub score_weight_s1: f64,
    pub score_weight_s2: f64,
    pub accept_threshold: f64,
    pub borderline_delta: f64,

    // Budgets
    pub max_refinements: u32,
    pub tool_budget_per_turn: u32,
    pub tool_budget_per_refinement: u32,
    pub memory_budget: usize,
    /// Wall-clock soft budget for a whole request.
    pub latency_budget_ms: u64,

    // Uncertainty
    pub snne_samples: usize,
    pub snne_tau: f64,
    pub snne_drift_min_samples: usize,
    pub snne_drift_quantile_tolerance: f64,

    // Verifier
    pub faithfulness_enabled: bool,
    pub faithfulness_threshold: f64,

    // Retrieval
    pub rag_weight_sparse: f64,
    pub rag_weight_dense: f64,
    pub entity_boost: f64,

    // Conformal calibration
    pub cp_enabled: bool,
    pub cp_target_mis: f64,
    pub cp_min_accepts: usize,

    // Tools & policy
    pub tools_allowed: Vec<String>,
    pub tools_requiring_approval: Vec<String>,
    pub table_allowed: Vec<String>,
    pub table_policies: HashMap<String, HashMap<String, ColumnPolicy>>,
    pub table_query_max_rows: usize,
    pub table_query_time_limit_ms: u64,
    /// Per-table queries allowed per minute.
    pub table_rate_limit_per_minute: u32,

    // Egress
    pub egress_enforce_tls: bool,
    pub egress_block_private_ip: bool,
    pub egress_allow_redirects: u32,
    pub egress_max_payload_bytes: u64,
    pub egress_allowlist_hosts: Vec<String>,
    pub egress_denylist_hosts: Vec<String>,

    // Approvals / stream
    pub approvals_ttl_seconds: u64,
    pub heartbeat_seconds: u64,
    pub idempotency_ttl_seconds: u64,

    // Retention
    pub steps_ttl_days: u32,
    pub memory_ttl_days: u32,
    pub cp_artifacts_ttl_days: u32,
    pub ttl_sweep_interval_seconds: u64,

    // Planning (pre-composition optimizer)
    pub planning_enabled: bool,
    pub planning_mode: String,
    pub planning_budget: u32,

    // Guardrails
    pub guardrails_enabled: bool,
    pub guardrails_deny_patterns: Vec<String>,

    /// When true, every minted placeholder must be resolved (verified value
    /// or the unverified sentinel) before the final event, even when the
    /// draft never referenced it. See DESIGN.md open questions.
    pub resolve_unused_placeholders: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: "data/attest.sqlite".to_string(),
            score_weight_s1: 0.5,
            score_weight_s2: 0.5,
            accept_threshold: 0.85,
            borderline_delta: 0.05,
            max_refinements: 2,
            tool_budget_per_turn: 4,
            tool_budget_per_refinement: 2,
            memory_budget: 8,
            latency_budget_ms: 30_000,
            snne_samples: 5,
            snne_tau: 0.3,
            snne_drift_min_samples: 50,
            snne_drift_quantile_tolerance: 0.08,
            faithfulness_enabled: true,
            faithfulness_threshold: 0.6,
            rag_weight_sparse: 0.5,
            rag_weight_dense: 0.5,
            entity_boost: 0.15,
            cp_enabled: true,
            cp_target_mis: 0.05,
            cp_min_accepts: 10,
            tools_allowed: Vec::new(),
            tools_requiring_approval: Vec::new(),
            table_allowed: Vec::new(),
            table_policies: HashMap::new(),
            table_query_max_rows: 25,
            table_query_time_limit_ms: 250,
            table_rate_limit_per_minute: 30,
            egress_enforce_tls: true,
            egress_block_private_ip: true,
            egress_allow_redirects: 3,
            egress_max_payload_bytes: 5 * 1024 * 1024,
            egress_allowlist_hosts: Vec::new(),
            egress_denylist_hosts: Vec::new(),
            approvals_ttl_seconds: 1800,
            heartbeat_seconds: 15,
            idempotency_ttl_seconds: 1800,
            steps_ttl_days: 90,
            memory_ttl_days: 60,
            cp_artifacts_ttl_days: 90,
            ttl_sweep_interval_seconds: 3600,
            planning_enabled: false,
            planning_mode: "single_shot".to_string(),
            planning_budget: 0,
            guardrails_enabled: false,
            guardrails_deny_patterns: Vec::new(),
            resolve_unused_placeholders: true,
        }
    }
}

impl Settings {
    /// Load settings: defaults, then `path` (if present), then env.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p).map_err(|e| {
                    EngineError::resource_with_source("read settings file", e)
                })?;
                toml::from_str(&raw)
                    .map_err(|e| EngineError::validation(format!("settings parse: {e}")))?
            }
            _ => Self::default(),
        };
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("ATTEST_DB_PATH") {
            self.db_path = v;
        }
        if let Ok(v) = env::var("ATTEST_ACCEPT_THRESHOLD") {
            if let Ok(parsed) = v.parse() {
                self.accept_threshold = parsed;
            }
        }
        if let Ok(v) = env::var("ATTEST_MAX_REFINEMENTS") {
            if let Ok(parsed) = v.parse() {
                self.max_refinements = parsed;
            }
        }
        if let Ok(v) = env::var("ATTEST_CP_ENABLED") {
            self.cp_enabled = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.accept_threshold) {
            return Err(EngineError::validation("accept_threshold must be in [0,1]"));
        }
        if self.borderline_delta < 0.0 || self.borderline_delta > self.accept_threshold {
            return Err(EngineError::validation(
                "borderline_delta must be in [0, accept_threshold]",
            ));
        }
        let weight_sum = self.score_weight_s1 + self.score_weight_s2;
        if (weight_sum - 1.0).abs() > 0.01 {
            return Err(EngineError::validation("score weights must sum to 1.0"));
        }
        if self.memory_budget == 0 || self.memory_budget > 32 {
            return Err(EngineError::validation("memory_budget must be in [1,32]"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.tool_budget_per_turn, 4);
        assert_eq!(settings.tool_budget_per_refinement, 2);
        assert_eq!(settings.max_refinements, 2);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let parsed: Settings = toml::from_str(
            r#"
            accept_threshold = 0.7
            tools_allowed = ["MATH_EVAL"]

            [table_policies.demo.count]
            non_negative = true
            "#,
        )
        .unwrap();
        assert!((parsed.accept_threshold - 0.7).abs() < 1e-9);
        assert_eq!(parsed.tools_allowed, vec!["MATH_EVAL"]);
        assert!(parsed.table_policies["demo"]["count"].non_negative);
        // untouched fields keep defaults
        assert_eq!(parsed.snne_samples, 5);
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let settings = Settings {
            score_weight_s1: 0.9,
            score_weight_s2: 0.5,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
