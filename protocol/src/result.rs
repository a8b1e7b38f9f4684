//! Final result payload and per-step trace records

use serde::{Deserialize, Serialize};

use crate::issues::Issue;

/// Terminal decision for a step or a whole request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Accept,
    Iterate,
    Abstain,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Iterate => "iterate",
            Self::Abstain => "abstain",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Built-in tool identifiers.
///
/// Serialized in SCREAMING_SNAKE_CASE to match policy allowlists and the
/// names surfaced in tool events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolName {
    WebSearch,
    WebFetch,
    MathEval,
    TableQuery,
}

impl ToolName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebSearch => "WEB_SEARCH",
            Self::WebFetch => "WEB_FETCH",
            Self::MathEval => "MATH_EVAL",
            Self::TableQuery => "TABLE_QUERY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WEB_SEARCH" => Some(Self::WebSearch),
            "WEB_FETCH" => Some(Self::WebFetch),
            "MATH_EVAL" => Some(Self::MathEval),
            "TABLE_QUERY" => Some(Self::TableQuery),
            _ => None,
        }
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Token and time counters attached to the final payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Fragments emitted for the accepted draft.
    #[serde(default)]
    pub draft_tokens: usize,
    /// Paraphrase samples generated across all SNNE readings.
    #[serde(default)]
    pub paraphrase_samples: usize,
    /// Tool invocations that actually executed (blocked calls excluded).
    #[serde(default)]
    pub tool_calls: usize,
    /// Refinement iterations performed beyond the initial pass.
    #[serde(default)]
    pub refinements: usize,
}

/// Summary of one decision cycle, kept in order inside the final payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTrace {
    pub step_index: usize,
    pub is_refinement: bool,
    pub s1: f64,
    pub s2: f64,
    pub final_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cp_accept: Option<bool>,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub tools_used: Vec<ToolName>,
    pub action: Action,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_summary: Option<String>,
    #[serde(default)]
    pub latency_ms: u64,
}

/// Full structured result carried by the terminal `final` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub request_id: String,
    /// Answer text with verified numbers substituted; placeholders never
    /// survive into this field.
    pub answer: String,
    pub action: Action,
    pub s1: f64,
    pub s2: f64,
    pub final_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cp_accept: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cp_tau: Option<f64>,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub tools_used: Vec<ToolName>,
    #[serde(default)]
    pub pack_ids: Vec<String>,
    pub trace: Vec<StepTrace>,
    pub latency_ms: u64,
    #[serde(default)]
    pub usage: Usage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issues::IssueKind;

    fn sample_result() -> AgentResult {
        AgentResult {
            request_id: "req-1".to_string(),
            answer: "X is Y.".to_string(),
            action: Action::Accept,
            s1: 0.9,
            s2: 0.9,
            final_score: 0.9,
            cp_accept: Some(true),
            cp_tau: Some(0.7),
            issues: vec![Issue::new(IssueKind::MissingCitations)],
            tools_used: vec![ToolName::MathEval],
            pack_ids: vec!["m-1".to_string()],
            trace: vec![StepTrace {
                step_index: 0,
                is_refinement: false,
                s1: 0.9,
                s2: 0.9,
                final_score: 0.9,
                cp_accept: Some(true),
                issues: vec![],
                tools_used: vec![],
                action: Action::Accept,
                reason: "initial".to_string(),
                change_summary: None,
                latency_ms: 3,
            }],
            latency_ms: 12,
            usage: Usage::default(),
        }
    }

    #[test]
    fn test_tool_name_wire_format() {
        assert_eq!(
            serde_json::to_string(&ToolName::WebSearch).unwrap(),
            "\"WEB_SEARCH\""
        );
        assert_eq!(ToolName::parse("TABLE_QUERY"), Some(ToolName::TableQuery));
        assert_eq!(ToolName::parse("SHELL"), None);
    }

    #[test]
    fn test_agent_result_roundtrip_preserves_fields() {
        let result = sample_result();
        let json = serde_json::to_string(&result).unwrap();
        let back: AgentResult = serde_json::from_str(&json).unwrap();
        assert_eq!(result, back);
    }

    #[test]
    fn test_cp_fields_omitted_when_uncalibrated() {
        let mut result = sample_result();
        result.cp_accept = None;
        result.cp_tau = None;
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("cp_accept").is_none());
        assert!(json.get("cp_tau").is_none());
    }
}
