//! attest-core: calibrated question-answering orchestration engine
//!
//! The engine couples five subsystems behind one orchestrator:
//! - hybrid retrieval over a local index (`attest-retrieval`)
//! - semantic nearest-neighbor entropy uncertainty ([`uq`])
//! - a structured verifier ([`verify`])
//! - a refinement loop with bounded tool dispatch and approvals
//!   ([`orchestrator`], [`tools`], [`approvals`])
//! - a decision head combining conformal thresholds with a calibrated
//!   score ([`policy`])
//!
//! Adjacent facilities (HTTP transport, UI, dashboards) are external
//! collaborators; [`api`] exposes the narrow, transport-agnostic surface
//! they consume.

pub mod api;
pub mod approvals;
pub mod audit;
pub mod compose;
pub mod config;
pub mod errors;
pub mod gov;
pub mod metrics;
pub mod orchestrator;
pub mod pcn;
pub mod planning;
pub mod policy;
pub mod security;
pub mod storage;
pub mod stream;
pub mod tools;
pub mod uq;
pub mod verify;

pub use config::Settings;
pub use errors::{EngineError, Result};
pub use orchestrator::{AskParams, Engine};
