//! Step audit logging
//!
//! Builds redacted StepRecords from orchestrator state, persists them,
//! and mirrors a compact JSON line into the structured log. Raw
//! question/answer text never reaches either sink.

use serde_json::json;
use tracing::{info, warn};

use attest_protocol::{Issue, StepTrace, ToolName};

use crate::errors::Result;
use crate::security::redaction::redact;
use crate::storage::{steps, DbPool};

const TRACE_TEXT_LIMIT: usize = 240;

fn clip(text: &str) -> String {
    if text.chars().count() <= TRACE_TEXT_LIMIT {
        text.to_string()
    } else {
        text.chars().take(TRACE_TEXT_LIMIT).collect()
    }
}

/// Build the per-step trace JSON: tool metadata with bounded text, no
/// raw fetched content, no secrets.
pub fn trace_json(
    step: &StepTrace,
    tool_meta: &[serde_json::Value],
    prompt_preview: Option<&str>,
) -> String {
    json!({
        "step_index": step.step_index,
        "is_refinement": step.is_refinement,
        "scores": {"s1": step.s1, "s2": step.s2, "final": step.final_score},
        "issues": step.issues.iter().map(|i| i.kind.as_str()).collect::<Vec<_>>(),
        "tools": tool_meta,
        "prompt_preview": prompt_preview.map(clip),
    })
    .to_string()
}

/// Inputs for one persisted step.
pub struct StepAudit<'a> {
    pub request_id: &'a str,
    pub domain: &'a str,
    pub question: &'a str,
    pub answer: &'a str,
    pub status: &'a str,
    pub step: &'a StepTrace,
    pub pack_ids: &'a [String],
    pub trace_json: Option<String>,
}

/// Redact and persist one step record; returns the step id.
///
/// Persistence failures degrade to a warning so an audit hiccup cannot
/// abort the request that produced it.
pub fn persist_step(pool: &DbPool, audit: &StepAudit<'_>) -> Result<Option<String>> {
    let (question_redacted, q_masked) = redact(audit.question);
    let (answer_redacted, a_masked) = redact(audit.answer);

    let record = steps::StepRecord {
        id: String::new(),
        ts: 0.0,
        request_id: audit.request_id.to_string(),
        step: audit.step.step_index,
        question: question_redacted,
        answer: answer_redacted,
        domain: audit.domain.to_string(),
        s1: audit.step.s1,
        s2: audit.step.s2,
        final_score: audit.step.final_score,
        cp_accept: audit.step.cp_accept,
        action: audit.step.action,
        reason: audit.step.reason.clone(),
        is_refinement: audit.step.is_refinement,
        status: audit.status.to_string(),
        latency_ms: audit.step.latency_ms,
        usage_json: None,
        pack_ids: audit.pack_ids.to_vec(),
        issues: issue_kinds(&audit.step.issues),
        tools_used: tool_names(&audit.step.tools_used),
        change_summary: audit.step.change_summary.clone(),
        trace_json: audit.trace_json.clone(),
    };

    let conn = match pool.get() {
        Ok(conn) => conn,
        Err(e) => {
            warn!(error = %e, "audit pool unavailable, step not persisted");
            return Ok(None);
        }
    };
    match steps::insert_step(&conn, &record) {
        Ok(id) => {
            info!(
                step_id = %id,
                request_id = %audit.request_id,
                step = audit.step.step_index,
                action = %audit.step.action,
                final_score = audit.step.final_score,
                redacted = q_masked || a_masked,
                "step persisted"
            );
            Ok(Some(id))
        }
        Err(e) => {
            warn!(error = %e, "step insert failed");
            Ok(None)
        }
    }
}

fn issue_kinds(issues: &[Issue]) -> Vec<String> {
    issues.iter().map(|i| i.kind.as_str().to_string()).collect()
}

fn tool_names(tools: &[ToolName]) -> Vec<String> {
    tools.iter().map(|t| t.as_str().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use attest_protocol::{Action, IssueKind};
    use crate::storage::test_pool;

    fn step() -> StepTrace {
        StepTrace {
            step_index: 0,
            is_refinement: false,
            s1: 0.9,
            s2: 0.8,
            final_score: 0.85,
            cp_accept: Some(true),
            issues: vec![Issue::new(IssueKind::MissingCitations)],
            tools_used: vec![ToolName::MathEval],
            action: Action::Accept,
            reason: "initial".to_string(),
            change_summary: None,
            latency_ms: 5,
        }
    }

    #[test]
    fn test_persisted_step_is_redacted() {
        let pool = test_pool();
        let audit = StepAudit {
            request_id: "req-1",
            domain: "default",
            question: "email bob@example.com about ssn 123-45-6789",
            answer: "contact stored for bob@example.com",
            status: "ok",
            step: &step(),
            pack_ids: &["c1".to_string()],
            trace_json: None,
        };
        let id = persist_step(&pool, &audit).unwrap().expect("persisted");
        let conn = pool.get().unwrap();
        let record = steps::get_step(&conn, &id).unwrap().unwrap();
        assert!(!record.question.contains("bob@example.com"));
        assert!(!record.question.contains("123-45-6789"));
        assert!(!record.answer.contains("bob@example.com"));
        assert_eq!(record.tools_used, vec!["MATH_EVAL"]);
        assert_eq!(record.issues, vec!["missing_citations"]);
    }

    #[test]
    fn test_trace_json_clips_previews() {
        let long_preview = "p".repeat(1000);
        let raw = trace_json(&step(), &[], Some(&long_preview));
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let preview = parsed["prompt_preview"].as_str().unwrap();
        assert!(preview.len() <= 240);
        assert_eq!(parsed["scores"]["final"], 0.85);
    }
}
