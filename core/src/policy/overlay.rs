//! Workspace policy overlays
//!
//! A workspace policy is a key-value overlay with a closed, validated key
//! set. Layering order: engine settings, then the workspace overlay, then
//! per-request overrides. The result is one `RequestPolicy` consumed by
//! the orchestrator for the lifetime of a request.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use attest_protocol::ToolName;

use crate::config::{ColumnPolicy, Settings};
use crate::errors::{EngineError, Result};
use crate::orchestrator::AskParams;
use crate::security::egress::EgressPolicy;

/// Closed set of keys a workspace overlay may carry.
pub const ALLOWED_OVERLAY_KEYS: &[&str] = &[
    "accept_threshold",
    "borderline_delta",
    "tool_budget_per_turn",
    "tool_budget_per_refinement",
    "tools_requiring_approval",
    "tools_allowed",
    "table_allowed",
    "rag_weight_sparse",
    "rag_weight_dense",
    "vector_backend",
    "egress_enforce_tls",
    "egress_block_private_ip",
    "egress_allow_redirects",
    "egress_max_payload_bytes",
    "egress_allowlist_hosts",
    "egress_denylist_hosts",
];

/// Effective policy for one request after all layers are applied.
#[derive(Debug, Clone)]
pub struct RequestPolicy {
    pub domain: String,
    pub accept_threshold: f64,
    pub borderline_delta: f64,
    pub score_weight_s1: f64,
    pub score_weight_s2: f64,

    pub max_refinements: u32,
    pub tool_budget_per_turn: u32,
    pub tool_budget_per_refinement: u32,
    pub memory_budget: usize,
    pub latency_budget_ms: u64,

    /// `None` means every tool is allowed (empty allowlist).
    pub tools_allowed: Option<HashSet<ToolName>>,
    pub tools_requiring_approval: HashSet<ToolName>,
    /// Tools pre-approved for this request (bypass the approval pause).
    pub approved_tools: HashSet<ToolName>,

    pub table_allowed: Vec<String>,
    pub table_policies: HashMap<String, HashMap<String, ColumnPolicy>>,
    pub table_query_max_rows: usize,
    pub table_query_time_limit_ms: u64,
    pub table_rate_limit_per_minute: u32,
    /// Operator-supplied SQL override for TABLE_QUERY.
    pub table_query_sql: Option<String>,

    pub egress: EgressPolicy,

    pub rag_weight_sparse: f64,
    pub rag_weight_dense: f64,
    pub entity_boost: f64,
    pub use_dense: bool,

    pub snne_samples: usize,
    pub snne_tau: f64,
    pub faithfulness_enabled: bool,
    pub faithfulness_threshold: f64,

    pub cp_enabled: bool,

    pub planning_enabled: bool,
    pub planning_mode: String,
    pub planning_budget: u32,

    pub guardrails_enabled: bool,
    pub resolve_unused_placeholders: bool,
}

fn tool_set(names: &[String]) -> Result<HashSet<ToolName>> {
    let mut out = HashSet::new();
    for name in names {
        let tool = ToolName::parse(name)
            .ok_or_else(|| EngineError::validation(format!("unknown tool name: {name}")))?;
        out.insert(tool);
    }
    Ok(out)
}

fn as_f64(key: &str, value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| EngineError::validation(format!("overlay key {key} must be a number")))
}

fn as_u64(key: &str, value: &Value) -> Result<u64> {
    value
        .as_u64()
        .ok_or_else(|| EngineError::validation(format!("overlay key {key} must be a non-negative integer")))
}

fn as_bool(key: &str, value: &Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| EngineError::validation(format!("overlay key {key} must be a boolean")))
}

fn as_string_list(key: &str, value: &Value) -> Result<Vec<String>> {
    let items = value
        .as_array()
        .ok_or_else(|| EngineError::validation(format!("overlay key {key} must be a list")))?;
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| EngineError::validation(format!("overlay key {key} must list strings")))
        })
        .collect()
}

impl RequestPolicy {
    /// Build the effective policy from settings, a workspace overlay, and
    /// per-request overrides. Unknown overlay keys are rejected.
    pub fn build(
        settings: &Settings,
        overlay: &HashMap<String, Value>,
        params: &AskParams,
    ) -> Result<Self> {
        let mut policy = Self::from_settings(settings, params)?;
        policy.apply_overlay(overlay)?;
        policy.apply_request_overrides(params)?;
        Ok(policy)
    }

    fn from_settings(settings: &Settings, params: &AskParams) -> Result<Self> {
        let tools_allowed = if settings.tools_allowed.is_empty() {
            None
        } else {
            Some(tool_set(&settings.tools_allowed)?)
        };
        Ok(Self {
            domain: params.domain.trim().to_lowercase(),
            accept_threshold: settings.accept_threshold,
            borderline_delta: settings.borderline_delta,
            score_weight_s1: settings.score_weight_s1,
            score_weight_s2: settings.score_weight_s2,
            max_refinements: settings.max_refinements,
            tool_budget_per_turn: settings.tool_budget_per_turn,
            tool_budget_per_refinement: settings.tool_budget_per_refinement,
            memory_budget: settings.memory_budget,
            latency_budget_ms: settings.latency_budget_ms,
            tools_allowed,
            tools_requiring_approval: tool_set(&settings.tools_requiring_approval)?,
            approved_tools: HashSet::new(),
            table_allowed: settings.table_allowed.clone(),
            table_policies: settings.table_policies.clone(),
            table_query_max_rows: settings.table_query_max_rows,
            table_query_time_limit_ms: settings.table_query_time_limit_ms,
            table_rate_limit_per_minute: settings.table_rate_limit_per_minute,
            table_query_sql: None,
            egress: EgressPolicy {
                enforce_tls: settings.egress_enforce_tls,
                block_private_ip: settings.egress_block_private_ip,
                allow_redirects: settings.egress_allow_redirects,
                max_payload_bytes: settings.egress_max_payload_bytes,
                allowlist_hosts: settings.egress_allowlist_hosts.clone(),
                denylist_hosts: settings.egress_denylist_hosts.clone(),
            },
            rag_weight_sparse: settings.rag_weight_sparse,
            rag_weight_dense: settings.rag_weight_dense,
            entity_boost: settings.entity_boost,
            use_dense: true,
            snne_samples: settings.snne_samples,
            snne_tau: settings.snne_tau,
            faithfulness_enabled: settings.faithfulness_enabled,
            faithfulness_threshold: settings.faithfulness_threshold,
            cp_enabled: settings.cp_enabled,
            planning_enabled: settings.planning_enabled,
            planning_mode: settings.planning_mode.clone(),
            planning_budget: settings.planning_budget,
            guardrails_enabled: settings.guardrails_enabled,
            resolve_unused_placeholders: settings.resolve_unused_placeholders,
        })
    }

    fn apply_overlay(&mut self, overlay: &HashMap<String, Value>) -> Result<()> {
        for (key, value) in overlay {
            match key.as_str() {
                "accept_threshold" => self.accept_threshold = as_f64(key, value)?,
                "borderline_delta" => self.borderline_delta = as_f64(key, value)?,
                "tool_budget_per_turn" => self.tool_budget_per_turn = as_u64(key, value)? as u32,
                "tool_budget_per_refinement" => {
                    self.tool_budget_per_refinement = as_u64(key, value)? as u32
                }
                "tools_requiring_approval" => {
                    self.tools_requiring_approval = tool_set(&as_string_list(key, value)?)?
                }
                "tools_allowed" => {
                    let list = as_string_list(key, value)?;
                    self.tools_allowed = if list.is_empty() {
                        None
                    } else {
                        Some(tool_set(&list)?)
                    };
                }
                "table_allowed" => self.table_allowed = as_string_list(key, value)?,
                "rag_weight_sparse" => self.rag_weight_sparse = as_f64(key, value)?,
                "rag_weight_dense" => self.rag_weight_dense = as_f64(key, value)?,
                "vector_backend" => {
                    let backend = value.as_str().unwrap_or("none").to_lowercase();
                    self.use_dense = backend != "none";
                }
                "egress_enforce_tls" => self.egress.enforce_tls = as_bool(key, value)?,
                "egress_block_private_ip" => self.egress.block_private_ip = as_bool(key, value)?,
                "egress_allow_redirects" => {
                    self.egress.allow_redirects = as_u64(key, value)? as u32
                }
                "egress_max_payload_bytes" => {
                    self.egress.max_payload_bytes = as_u64(key, value)?
                }
                "egress_allowlist_hosts" => {
                    self.egress.allowlist_hosts = as_string_list(key, value)?
                }
                "egress_denylist_hosts" => {
                    self.egress.denylist_hosts = as_string_list(key, value)?
                }
                _ => {
                    return Err(EngineError::validation(format!(
                        "unknown workspace policy key: {key}"
                    )))
                }
            }
        }
        Ok(())
    }

    fn apply_request_overrides(&mut self, params: &AskParams) -> Result<()> {
        if let Some(v) = params.max_refinements {
            self.max_refinements = v;
        }
        if let Some(v) = params.tool_budget_per_turn {
            self.tool_budget_per_turn = v;
        }
        if let Some(v) = params.tool_budget_per_refinement {
            self.tool_budget_per_refinement = v;
        }
        if let Some(v) = params.memory_budget {
            if !(1..=32).contains(&v) {
                return Err(EngineError::validation("memory_budget must be in [1,32]"));
            }
            self.memory_budget = v;
        }
        if let Some(v) = params.accept_threshold {
            self.accept_threshold = v;
        }
        if let Some(v) = params.borderline_delta {
            self.borderline_delta = v;
        }
        if let Some(v) = params.snne_samples {
            self.snne_samples = v.clamp(2, 8);
        }
        if let Some(v) = params.latency_budget_ms {
            self.latency_budget_ms = v;
        }
        if let Some(sql) = &params.table_query_sql {
            self.table_query_sql = Some(sql.clone());
        }
        if !params.approved_tools.is_empty() {
            self.approved_tools = tool_set(&params.approved_tools)?;
        }
        if let Some(v) = params.planning_enabled {
            self.planning_enabled = v;
        }
        if let Some(v) = &params.planning_mode {
            self.planning_mode = v.clone();
        }
        if let Some(v) = params.planning_budget {
            self.planning_budget = v;
        }
        Ok(())
    }

    /// Whether a tool passes the allowlist.
    pub fn tool_allowed(&self, tool: ToolName) -> bool {
        match &self.tools_allowed {
            None => true,
            Some(set) => set.contains(&tool),
        }
    }

    /// Whether a tool needs an approval pause (and has not been
    /// pre-approved for this request).
    pub fn tool_needs_approval(&self, tool: ToolName) -> bool {
        self.tools_requiring_approval.contains(&tool) && !self.approved_tools.contains(&tool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::AskParams;

    fn params() -> AskParams {
        AskParams {
            question: "q".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_unknown_overlay_key_rejected() {
        let mut overlay = HashMap::new();
        overlay.insert("sneaky_key".to_string(), serde_json::json!(1));
        let err = RequestPolicy::build(&Settings::default(), &overlay, &params()).unwrap_err();
        assert!(err.to_string().contains("sneaky_key"));
    }

    #[test]
    fn test_overlay_overrides_settings() {
        let mut overlay = HashMap::new();
        overlay.insert("accept_threshold".to_string(), serde_json::json!(0.65));
        overlay.insert(
            "tools_allowed".to_string(),
            serde_json::json!(["MATH_EVAL"]),
        );
        let policy = RequestPolicy::build(&Settings::default(), &overlay, &params()).unwrap();
        assert!((policy.accept_threshold - 0.65).abs() < 1e-9);
        assert!(policy.tool_allowed(ToolName::MathEval));
        assert!(!policy.tool_allowed(ToolName::WebFetch));
    }

    #[test]
    fn test_request_overrides_win_over_overlay() {
        let mut overlay = HashMap::new();
        overlay.insert("accept_threshold".to_string(), serde_json::json!(0.65));
        let mut p = params();
        p.accept_threshold = Some(0.9);
        p.max_refinements = Some(0);
        let policy = RequestPolicy::build(&Settings::default(), &overlay, &p).unwrap();
        assert!((policy.accept_threshold - 0.9).abs() < 1e-9);
        assert_eq!(policy.max_refinements, 0);
    }

    #[test]
    fn test_empty_allowlist_means_all_allowed() {
        let policy = RequestPolicy::build(&Settings::default(), &HashMap::new(), &params()).unwrap();
        assert!(policy.tool_allowed(ToolName::WebSearch));
        assert!(policy.tool_allowed(ToolName::TableQuery));
    }

    #[test]
    fn test_approval_bypass_with_preapproved_tools() {
        let settings = Settings {
            tools_requiring_approval: vec!["WEB_FETCH".to_string()],
            ..Default::default()
        };
        let mut p = params();
        assert!(RequestPolicy::build(&settings, &HashMap::new(), &p)
            .unwrap()
            .tool_needs_approval(ToolName::WebFetch));
        p.approved_tools = vec!["WEB_FETCH".to_string()];
        assert!(!RequestPolicy::build(&settings, &HashMap::new(), &p)
            .unwrap()
            .tool_needs_approval(ToolName::WebFetch));
    }

    #[test]
    fn test_invalid_memory_budget_rejected() {
        let mut p = params();
        p.memory_budget = Some(64);
        assert!(RequestPolicy::build(&Settings::default(), &HashMap::new(), &p).is_err());
    }
}
