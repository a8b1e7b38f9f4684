//! Structured verifier (S2)
//!
//! A rule engine covers citation coverage, unresolved numeric
//! placeholders, question-driven expectations, injection suspicion, and
//! claim faithfulness. A model-backed verifier may supplement the rules;
//! malformed model output is retried once and then degrades to
//! `needs_fix` with `verifier_degenerate`.

pub mod faithfulness;

use serde::{Deserialize, Serialize};
use tracing::warn;

use attest_protocol::{Issue, IssueKind};
use attest_retrieval::pack::Pack;

use crate::security::prompt_guard;

/// Verifier output for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifierResult {
    /// Verifier score in [0,1].
    pub s2: f64,
    pub issues: Vec<Issue>,
    pub needs_fix: bool,
}

/// Structured output contract for model-backed verifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVerdict {
    pub score: f64,
    #[serde(default)]
    pub issues: Vec<String>,
    pub needs_fix: bool,
}

/// Optional model-backed supplement to the rule engine.
pub trait ModelVerifier: Send + Sync {
    /// Evaluate an answer; Err means malformed/unavailable output.
    fn evaluate(&self, question: &str, answer: &str) -> Result<ModelVerdict, String>;
}

/// Inputs the rule engine considers beyond the text pair.
#[derive(Debug, Clone, Default)]
pub struct VerifyContext<'a> {
    pub pack: Option<&'a Pack>,
    /// PCN ids referenced by the draft that are not verified.
    pub pending_placeholders: &'a [String],
    /// Failures from the latest GoV evaluation.
    pub gov_failures: &'a [String],
    pub faithfulness_enabled: bool,
    pub faithfulness_threshold: f64,
}

/// Structured verifier with rule fallback.
pub struct Verifier {
    model: Option<Box<dyn ModelVerifier>>,
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Verifier {
    pub fn new() -> Self {
        Self { model: None }
    }

    pub fn with_model(model: Box<dyn ModelVerifier>) -> Self {
        Self { model: Some(model) }
    }

    /// Verify an answer. Rules always run; a model verdict, when
    /// available and well-formed, tightens the score.
    pub fn verify(&self, question: &str, answer: &str, ctx: &VerifyContext<'_>) -> VerifierResult {
        let mut result = rule_verify(question, answer, ctx);

        if let Some(model) = &self.model {
            match self.model_verdict(model.as_ref(), question, answer) {
                Some(verdict) => {
                    result.s2 = (result.s2.min(verdict.score)).clamp(0.0, 1.0);
                    for raw in verdict.issues {
                        if let Some(issue) = parse_issue(&raw) {
                            if !result.issues.iter().any(|i| i.kind == issue.kind) {
                                result.issues.push(issue);
                            }
                        }
                    }
                    result.needs_fix = result.needs_fix || verdict.needs_fix;
                }
                None => {
                    // Two malformed responses: force a fix signal.
                    result.issues.push(Issue::new(IssueKind::VerifierDegenerate));
                    result.needs_fix = true;
                }
            }
        }

        result.needs_fix = result.needs_fix || !result.issues.is_empty();
        result
    }

    fn model_verdict(
        &self,
        model: &dyn ModelVerifier,
        question: &str,
        answer: &str,
    ) -> Option<ModelVerdict> {
        for attempt in 0..2 {
            match model.evaluate(question, answer) {
                Ok(verdict) if (0.0..=1.0).contains(&verdict.score) => return Some(verdict),
                Ok(_) => warn!(attempt, "model verifier returned out-of-range score"),
                Err(e) => warn!(attempt, error = %e, "model verifier malformed output"),
            }
        }
        None
    }
}

fn parse_issue(raw: &str) -> Option<Issue> {
    serde_json::from_value::<IssueKind>(serde_json::Value::String(raw.trim().to_string()))
        .ok()
        .map(Issue::new)
}

fn question_needs(question: &str) -> (bool, bool, bool) {
    let q = question.to_lowercase();
    let needs_numbers = ["count", "number", "how many", "metric", "sum", "total"]
        .iter()
        .any(|w| q.contains(w));
    let needs_citation = ["cite", "source", "reference", "citation"]
        .iter()
        .any(|w| q.contains(w));
    let needs_table = ["sql", "table", "database", "cohort", "rows"]
        .iter()
        .any(|w| q.contains(w));
    (needs_numbers, needs_citation, needs_table)
}

fn rule_verify(question: &str, answer: &str, ctx: &VerifyContext<'_>) -> VerifierResult {
    let mut issues: Vec<Issue> = Vec::new();

    let has_digits = answer.chars().any(|c| c.is_ascii_digit());
    let has_link = answer.contains("http://") || answer.contains("https://");
    let (needs_numbers, needs_citation, needs_table) = question_needs(question);

    if needs_numbers && !has_digits {
        issues.push(Issue::new(IssueKind::MissingNumbers));
    }
    if needs_citation && !has_link {
        issues.push(Issue::new(IssueKind::MissingCitations));
    }
    if needs_table && !has_digits {
        issues.push(Issue::new(IssueKind::MissingTableData));
    }

    if !ctx.pending_placeholders.is_empty() {
        issues.push(Issue::with_detail(
            IssueKind::NumericUnverified,
            format!("{} placeholder(s) unresolved", ctx.pending_placeholders.len()),
        ));
    }
    for failure in ctx.gov_failures {
        if !issues.iter().any(|i| i.kind == IssueKind::Governance) {
            issues.push(Issue::with_detail(IssueKind::Governance, failure.clone()));
        }
    }

    if !prompt_guard::detect_injection(answer).is_empty() {
        issues.push(Issue::new(IssueKind::InjectionSuspected));
    }

    match ctx.pack {
        Some(pack) if !pack.is_empty() => {
            if ctx.faithfulness_enabled {
                let score = faithfulness::compute_faithfulness(answer, pack);
                if score < ctx.faithfulness_threshold {
                    issues.push(Issue::with_detail(
                        IssueKind::UnsupportedClaim,
                        format!("faithfulness {score:.2}"),
                    ));
                }
            }
        }
        _ => {
            issues.push(Issue::new(IssueKind::MissingEvidence));
        }
    }

    let s2 = if issues.is_empty() {
        if has_digits || has_link {
            0.9
        } else {
            0.6
        }
    } else {
        // Each issue knocks the score down; floor at 0.1.
        (0.6 - 0.15 * issues.len() as f64).max(0.1)
    };

    VerifierResult {
        s2,
        needs_fix: !issues.is_empty(),
        issues,
    }
}
