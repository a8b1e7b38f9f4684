//! Tagged stream events and their SSE encoding
//!
//! One variant per stream event. The orchestrator constructs typed payloads
//! and the stream writer calls [`Event::to_sse_frame`]; nothing else in the
//! engine touches the serialized form.

use serde::{Deserialize, Serialize};

use crate::result::{AgentResult, ToolName};

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyPayload {
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub text: String,
}

/// Scores for one completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScorePayload {
    pub s1: f64,
    pub s2: f64,
    pub final_score: f64,
    /// `None` when no conformal threshold exists for the domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cp_accept: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cp_tau: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracePayload {
    pub step: usize,
    pub is_refinement: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub tools_used: Vec<ToolName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_summary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Start,
    Stop,
    Blocked,
    Error,
    WaitingApproval,
}

/// Per-tool metadata surfaced in tool events. Fields are populated per
/// tool kind; everything is optional so one record covers all four tools.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injection_blocked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<usize>,
    /// Remaining per-refinement budget after this call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_remaining: Option<u32>,
    /// Remaining per-turn budget after this call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_remaining: Option<u32>,
}

impl ToolMeta {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPayload {
    pub name: ToolName,
    pub status: ToolStatus,
    /// Approval id, present for `waiting_approval`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub meta: ToolMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PcnEventKind {
    PcnPending,
    PcnVerified,
    PcnFailed,
}

/// Verification policy attached to a proof-carrying number.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PcnPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

/// Where a verified value came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Provenance {
    Math { expr: String },
    Sql { sql_hash: String },
    Url { url: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcnPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: PcnEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub policy: PcnPolicy,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagDelta {
    pub ok: bool,
    #[serde(default)]
    pub failing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovPayload {
    pub dag_delta: DagDelta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningPayload {
    pub mode: String,
    pub budget: u32,
    pub candidates: usize,
    pub base_score: f64,
    pub best_score: f64,
    pub improved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailsStage {
    Pre,
    Post,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailsPayload {
    pub stage: GuardrailsStage,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Epoch seconds.
    pub t: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Event
// ─────────────────────────────────────────────────────────────────────────────

/// One stream event. `ready` is always first; exactly one of `final` or
/// `error` terminates the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    Ready(ReadyPayload),
    Token(TokenPayload),
    Score(ScorePayload),
    Trace(TracePayload),
    Tool(ToolPayload),
    Pcn(PcnPayload),
    Gov(GovPayload),
    Planning(PlanningPayload),
    Guardrails(GuardrailsPayload),
    Heartbeat(HeartbeatPayload),
    Error(ErrorPayload),
    Final(Box<AgentResult>),
}

impl Event {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready(_) => "ready",
            Self::Token(_) => "token",
            Self::Score(_) => "score",
            Self::Trace(_) => "trace",
            Self::Tool(_) => "tool",
            Self::Pcn(_) => "pcn",
            Self::Gov(_) => "gov",
            Self::Planning(_) => "planning",
            Self::Guardrails(_) => "guardrails",
            Self::Heartbeat(_) => "heartbeat",
            Self::Error(_) => "error",
            Self::Final(_) => "final",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Final(_) | Self::Error(_))
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Heartbeat(_))
    }

    /// JSON form of the data payload alone (without the event name tag).
    pub fn data_json(&self) -> serde_json::Result<String> {
        match self {
            Self::Ready(p) => serde_json::to_string(p),
            Self::Token(p) => serde_json::to_string(p),
            Self::Score(p) => serde_json::to_string(p),
            Self::Trace(p) => serde_json::to_string(p),
            Self::Tool(p) => serde_json::to_string(p),
            Self::Pcn(p) => serde_json::to_string(p),
            Self::Gov(p) => serde_json::to_string(p),
            Self::Planning(p) => serde_json::to_string(p),
            Self::Guardrails(p) => serde_json::to_string(p),
            Self::Heartbeat(p) => serde_json::to_string(p),
            Self::Error(p) => serde_json::to_string(p),
            Self::Final(p) => serde_json::to_string(p),
        }
    }

    /// Encode as a complete `event:`/`data:` SSE frame.
    pub fn to_sse_frame(&self) -> serde_json::Result<String> {
        Ok(format!("event: {}\ndata: {}\n\n", self.name(), self.data_json()?))
    }
}
