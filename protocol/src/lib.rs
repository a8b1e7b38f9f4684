//! Wire-level types shared by the engine and its surfaces
//!
//! This crate defines the tagged event vocabulary for the answer stream,
//! the final result payload, and the supporting enums (actions, issue
//! kinds, tool names). The stream encoder in `attest-core` is the only
//! site that serializes these variants; everything else passes typed
//! records around.

pub mod events;
pub mod issues;
pub mod result;

pub use events::{
    DagDelta, ErrorPayload, Event, GovPayload, GuardrailsPayload, GuardrailsStage,
    HeartbeatPayload, PcnEventKind, PcnPayload, PcnPolicy, PlanningPayload, Provenance,
    ReadyPayload, ScorePayload, TokenPayload, ToolMeta, ToolPayload, ToolStatus, TracePayload,
};
pub use issues::{Issue, IssueKind};
pub use result::{Action, AgentResult, StepTrace, ToolName, Usage};
