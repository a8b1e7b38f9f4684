//! Pre-emission planning
//!
//! An optional optimizer that proposes deterministic answer variants,
//! scores each with the same SNNE + verifier + policy pipeline, and
//! adopts a candidate only on strict improvement. Planning never changes
//! the event contract; it reports through one `planning` event.

use attest_retrieval::embeddings::EmbeddingBackend;
use attest_retrieval::pack::Pack;

use crate::policy::{final_score, DecisionConfig};
use crate::uq::{sampling, snne};
use crate::verify::{Verifier, VerifyContext, VerifierResult};

/// Planning strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanningMode {
    SingleShot,
    Beam,
    Tree,
}

impl PlanningMode {
    pub fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "beam" => Self::Beam,
            "tree" | "tot" => Self::Tree,
            _ => Self::SingleShot,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleShot => "single_shot",
            Self::Beam => "beam",
            Self::Tree => "tree",
        }
    }
}

/// A scored candidate answer.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub answer: String,
    pub s1: f64,
    pub raw_snne: Option<f64>,
    pub verdict: VerifierResult,
    pub score: f64,
}

/// Planning outcome adopted by the orchestrator.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub mode: PlanningMode,
    pub candidates: usize,
    pub base_score: f64,
    pub best: Option<ScoredCandidate>,
}

fn score_candidate(
    answer: &str,
    question: &str,
    pack: &Pack,
    sample_count: usize,
    snne_tau: f64,
    embedder: &dyn EmbeddingBackend,
    verifier: &Verifier,
    decision: &DecisionConfig,
    faithfulness_threshold: f64,
) -> ScoredCandidate {
    let snippets = pack.snippets(3);
    let samples = sampling::answer_variants(answer, question, &snippets, sample_count.max(2));
    let raw = snne::snne_raw(&samples, snne_tau, embedder);
    let mut s1 = raw.map(snne::normalize).unwrap_or(0.0);
    let ctx = VerifyContext {
        pack: Some(pack),
        pending_placeholders: &[],
        gov_failures: &[],
        faithfulness_enabled: true,
        faithfulness_threshold,
    };
    let verdict = verifier.verify(question, answer, &ctx);
    if verdict.needs_fix {
        s1 = (s1 - 0.1 * verdict.issues.len() as f64).max(0.0);
    }
    let score = final_score(s1, verdict.s2, decision);
    ScoredCandidate {
        answer: answer.to_string(),
        s1,
        raw_snne: raw,
        verdict,
        score,
    }
}

/// Propose and score candidates around `base_answer`.
#[allow(clippy::too_many_arguments)]
pub fn plan_best_answer(
    mode: PlanningMode,
    budget: u32,
    question: &str,
    pack: &Pack,
    base_answer: &str,
    sample_count: usize,
    snne_tau: f64,
    embedder: &dyn EmbeddingBackend,
    verifier: &Verifier,
    decision: &DecisionConfig,
    faithfulness_threshold: f64,
) -> PlanOutcome {
    let snippets = pack.snippets(3);
    let mut candidates: Vec<String> = vec![base_answer.to_string()];

    let extra = budget.saturating_sub(1) as usize;
    match mode {
        PlanningMode::SingleShot => {}
        PlanningMode::Tree => {
            if extra > 0 {
                for variant in sampling::answer_variants(base_answer, question, &snippets, extra + 1)
                    .into_iter()
                    .skip(1)
                {
                    if !candidates.contains(&variant) {
                        candidates.push(variant);
                    }
                }
            }
        }
        PlanningMode::Beam => {
            // Two-step beam over paraphrases of the current frontier.
            let width = 2usize;
            let mut beam = vec![base_answer.to_string()];
            for _ in 0..extra.min(3) {
                let mut proposals = Vec::new();
                for seed in &beam {
                    for variant in
                        sampling::answer_variants(seed, question, &snippets, width + 1)
                            .into_iter()
                            .skip(1)
                    {
                        if !candidates.contains(&variant) && !proposals.contains(&variant) {
                            proposals.push(variant);
                        }
                    }
                }
                candidates.extend(proposals.iter().cloned());
                beam = proposals;
                if beam.is_empty() {
                    break;
                }
            }
        }
    }

    let scored: Vec<ScoredCandidate> = candidates
        .iter()
        .map(|c| {
            score_candidate(
                c,
                question,
                pack,
                sample_count,
                snne_tau,
                embedder,
                verifier,
                decision,
                faithfulness_threshold,
            )
        })
        .collect();

    let base_score = scored.first().map(|c| c.score).unwrap_or(0.0);
    let best = scored
        .into_iter()
        .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));
    PlanOutcome {
        mode,
        candidates: candidates.len(),
        base_score,
        best: best.filter(|b| b.score > base_score),
    }
}
