//! Request orchestration
//!
//! One request is one cooperative task: retrieve, compose, score, verify,
//! decide, and refine with bounded tools until a terminal action lands.
//! The engine is parallel across requests; within a request everything
//! here runs sequentially with suspension points at tool I/O and
//! approval waits.
//!
//! Event order: `ready` first, then `token`* `score` `trace` for the
//! initial step; each refinement emits its tool/pcn/gov events, then
//! `score`, then `trace`; exactly one `final` or `error` ends the
//! stream. A step's record is persisted before the next iteration's
//! score event.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use attest_protocol::{
    Action, DagDelta, Event, GovPayload, GuardrailsPayload, GuardrailsStage, Issue, IssueKind,
    PcnPolicy, PlanningPayload, Provenance, ReadyPayload, ScorePayload, StepTrace, TokenPayload,
    ToolMeta, ToolName, ToolPayload, ToolStatus, TracePayload, AgentResult, Usage,
};
use attest_retrieval::pack::Pack;
use attest_retrieval::{Retriever, RetrieverConfig};

use crate::approvals::{ApprovalState, ApprovalsStore};
use crate::audit::{self, StepAudit};
use crate::compose::{build_refinement_prompt, Generator, RefinementContext};
use crate::config::Settings;
use crate::errors::{EngineError, Result};
use crate::gov::{self, Dag, DagEdge, DagNode, NodeType};
use crate::metrics::Metrics;
use crate::pcn::PcnLedger;
use crate::planning::{self, PlanningMode};
use crate::policy::cp::ThresholdTable;
use crate::policy::overlay::RequestPolicy;
use crate::policy::{decide, final_score, Decision, DecisionConfig};
use crate::security::guardrails::Guardrails;
use crate::storage::{workspaces, DbPool};
use crate::stream::EventSender;
use crate::tools::table_query::QueryLimits;
use crate::tools::{
    math_eval, table_query, web_fetch, web_search, TableRateLimiter, ToolErrorKind,
};
use crate::uq::calibration::SnneCalibrator;
use crate::uq::{sampling, snne};
use crate::verify::{Verifier, VerifyContext, VerifierResult};

/// Per-request input with optional overrides. Anything left `None`
/// falls back to the workspace overlay and engine settings.
#[derive(Debug, Clone, Default)]
pub struct AskParams {
    pub question: String,
    pub domain: String,
    pub workspace: String,
    pub request_id: Option<String>,
    pub idempotency_key: Option<String>,

    pub max_refinements: Option<u32>,
    pub tool_budget_per_turn: Option<u32>,
    pub tool_budget_per_refinement: Option<u32>,
    pub memory_budget: Option<usize>,
    pub accept_threshold: Option<f64>,
    pub borderline_delta: Option<f64>,
    pub snne_samples: Option<usize>,
    pub latency_budget_ms: Option<u64>,

    pub table_query_sql: Option<String>,
    /// Unit constraint applied to math-derived PCN entries.
    pub math_units: Option<String>,
    pub approved_tools: Vec<String>,

    pub planning_enabled: Option<bool>,
    pub planning_mode: Option<String>,
    pub planning_budget: Option<u32>,
}

impl AskParams {
    pub fn question(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            domain: "default".to_string(),
            workspace: "default".to_string(),
            ..Default::default()
        }
    }
}

/// The orchestration engine. Cheap to clone via `Arc` fields; one
/// instance serves all requests.
pub struct Engine {
    pub(crate) settings: Settings,
    pub(crate) pool: DbPool,
    pub(crate) retriever: Retriever,
    composer: Arc<dyn Generator>,
    verifier: Arc<Verifier>,
    pub(crate) approvals: Arc<ApprovalsStore>,
    pub(crate) thresholds: Arc<ThresholdTable>,
    calibrator: Arc<SnneCalibrator>,
    pub(crate) metrics: Arc<Metrics>,
    rate_limiter: Arc<TableRateLimiter>,
    guardrails: Arc<Guardrails>,
}

struct StepScore {
    s1: f64,
    raw: Option<f64>,
    sample_count: usize,
    verdict: VerifierResult,
    score: f64,
    decision: Decision,
}

struct RunState {
    answer: String,
    s1: f64,
    s2: f64,
    score: f64,
    decision: Decision,
    issues: Vec<Issue>,
    needs_fix: bool,
    trace: Vec<StepTrace>,
    tools_used_total: Vec<ToolName>,
    usage: Usage,
}

impl Engine {
    pub fn new(
        settings: Settings,
        pool: DbPool,
        retriever: Retriever,
        composer: Arc<dyn Generator>,
        verifier: Arc<Verifier>,
        approvals: Arc<ApprovalsStore>,
        thresholds: Arc<ThresholdTable>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let calibrator = Arc::new(SnneCalibrator::new(pool.clone()));
        let guardrails = Arc::new(Guardrails::from_patterns(&settings.guardrails_deny_patterns));
        Self {
            settings,
            pool,
            retriever,
            composer,
            verifier,
            approvals,
            thresholds,
            calibrator,
            metrics,
            rate_limiter: Arc::new(TableRateLimiter::new()),
            guardrails,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Answer a question, emitting the event stream and returning the
    /// final structured result. Exactly one terminal event is emitted.
    pub async fn answer(
        &self,
        params: AskParams,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Result<AgentResult> {
        let started = Instant::now();
        let request_id = params
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.metrics.requests.inc();
        events
            .emit(Event::Ready(ReadyPayload {
                request_id: request_id.clone(),
            }))
            .await;

        match self.run(&params, &request_id, &events, &cancel, started).await {
            Ok(result) => {
                self.metrics.record_action(result.action);
                self.metrics
                    .answer_latency
                    .observe_ms(started.elapsed().as_millis() as u64);
                events.emit(Event::Final(Box::new(result.clone()))).await;
                Ok(result)
            }
            Err(e) => {
                self.metrics.errors.inc();
                warn!(request_id = %request_id, error = %e, "request failed");
                events
                    .emit(Event::Error(attest_protocol::ErrorPayload {
                        code: e.wire_code().to_string(),
                        message: e.safe_message(),
                    }))
                    .await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        params: &AskParams,
        request_id: &str,
        events: &EventSender,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<AgentResult> {
        if params.question.trim().is_empty() {
            return Err(EngineError::validation("question must be non-empty"));
        }

        let overlay = {
            let conn = self.pool.get()?;
            workspaces::load_policy_values(&conn, &params.workspace)?
        };
        let policy = RequestPolicy::build(&self.settings, &overlay, params)?;
        let deadline = started + Duration::from_millis(policy.latency_budget_ms.max(1));

        // Pre-guard on the incoming question.
        if policy.guardrails_enabled && !self.guardrails.is_empty() {
            let violations = self.guardrails.violations(&params.question);
            if !violations.is_empty() {
                events
                    .emit(Event::Guardrails(GuardrailsPayload {
                        stage: GuardrailsStage::Pre,
                        violations,
                    }))
                    .await;
            }
        }

        // Retrieval. Failures degrade to an empty pack.
        let pack = self.retrieve(&params.question, &policy);
        let pack_ids = pack.ids();

        let mut ledger = PcnLedger::new();
        let mut state = self
            .initial_step(params, &policy, &pack, &ledger, events)
            .await?;
        self.persist_step(request_id, params, &policy, &state, &pack_ids, "ok", None);

        // Refinement loop.
        let mut iteration: u32 = 0;
        let mut turn_remaining = policy.tool_budget_per_turn;
        let mut session_approved: HashSet<ToolName> = policy.approved_tools.clone();
        let mut context_snips = pack.snippets(2);
        let candidate_urls = pack.urls();

        while state.decision.action == Action::Iterate
            && state.needs_fix
            && iteration < policy.max_refinements
            && turn_remaining > 0
        {
            if cancel.is_cancelled() {
                self.persist_step(
                    request_id,
                    params,
                    &policy,
                    &state,
                    &pack_ids,
                    "incomplete",
                    None,
                );
                return Err(EngineError::internal("request cancelled"));
            }
            if Instant::now() > deadline {
                state.decision = Decision {
                    action: Action::Abstain,
                    reason: "latency_budget".to_string(),
                    cp_accept: state.decision.cp_accept,
                    cp_tau: state.decision.cp_tau,
                };
                break;
            }

            iteration += 1;
            let outcome = self
                .refinement_iteration(
                    params,
                    request_id,
                    &policy,
                    &pack,
                    &mut ledger,
                    &mut state,
                    &mut turn_remaining,
                    &mut session_approved,
                    &mut context_snips,
                    &candidate_urls,
                    iteration,
                    events,
                    cancel,
                )
                .await?;
            state.usage.refinements = iteration as usize;
            self.persist_step(
                request_id,
                params,
                &policy,
                &state,
                &pack_ids,
                "ok",
                outcome.trace_json,
            );
            if outcome.stalled {
                // No tools ran and nothing resolved: avoid spinning.
                state.decision = Decision {
                    action: Action::Abstain,
                    reason: "no refinement progress".to_string(),
                    cp_accept: state.decision.cp_accept,
                    cp_tau: state.decision.cp_tau,
                };
                break;
            }
        }

        // Resolve every placeholder before the final event.
        if policy.resolve_unused_placeholders {
            for id in ledger.unresolved_ids() {
                if let Some(event) = ledger.fail(&id, "unused placeholder") {
                    events.emit(Event::Pcn(event)).await;
                }
            }
        }
        let answer = ledger.resolve_placeholders(&state.answer);
        debug_assert!(!PcnLedger::has_placeholder(&answer));

        // Post-guard on the outgoing answer.
        let mut final_issues = state.issues.clone();
        if policy.guardrails_enabled && !self.guardrails.is_empty() {
            let violations = self.guardrails.violations(&answer);
            if !violations.is_empty() {
                events
                    .emit(Event::Guardrails(GuardrailsPayload {
                        stage: GuardrailsStage::Post,
                        violations,
                    }))
                    .await;
                if !final_issues.iter().any(|i| i.kind == IssueKind::PolicyViolation) {
                    final_issues.push(Issue::new(IssueKind::PolicyViolation));
                }
            }
        }

        Ok(AgentResult {
            request_id: request_id.to_string(),
            answer,
            action: state.decision.action,
            s1: state.s1,
            s2: state.s2,
            final_score: state.score,
            cp_accept: state.decision.cp_accept,
            cp_tau: state.decision.cp_tau,
            issues: final_issues,
            tools_used: state.tools_used_total.clone(),
            pack_ids,
            trace: state.trace.clone(),
            latency_ms: started.elapsed().as_millis() as u64,
            usage: state.usage.clone(),
        })
    }

    fn retrieve(&self, question: &str, policy: &RequestPolicy) -> Pack {
        let config = RetrieverConfig {
            memory_k: policy.memory_budget,
            corpus_k: policy.memory_budget,
            budget: policy.memory_budget,
            w_sparse: policy.rag_weight_sparse,
            w_dense: policy.rag_weight_dense,
            entity_boost: policy.entity_boost,
            domain: Some(policy.domain.clone()),
            ..Default::default()
        };
        let conn = match self.pool.get() {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "retrieval pool unavailable, proceeding with empty pack");
                return Pack::empty();
            }
        };
        match self.retriever.build_pack(&conn, question, &config) {
            Ok(pack) => pack,
            Err(e) => {
                warn!(error = %e, "retrieval failed, proceeding with empty pack");
                Pack::empty()
            }
        }
    }

    async fn initial_step(
        &self,
        params: &AskParams,
        policy: &RequestPolicy,
        pack: &Pack,
        ledger: &PcnLedger,
        events: &EventSender,
    ) -> Result<RunState> {
        let mut draft = self.composer.initial_draft(&params.question, pack);

        // Optional pre-emission planning.
        if policy.planning_enabled && policy.planning_budget > 0 {
            let mode = PlanningMode::parse(&policy.planning_mode);
            let outcome = planning::plan_best_answer(
                mode,
                policy.planning_budget,
                &params.question,
                pack,
                &draft.text,
                policy.snne_samples,
                policy.snne_tau,
                self.retriever.embedder().as_ref(),
                &self.verifier,
                &self.decision_config(policy),
                policy.faithfulness_threshold,
            );
            let best_score = outcome
                .best
                .as_ref()
                .map(|b| b.score)
                .unwrap_or(outcome.base_score);
            events
                .emit(Event::Planning(PlanningPayload {
                    mode: mode.as_str().to_string(),
                    budget: policy.planning_budget,
                    candidates: outcome.candidates,
                    base_score: outcome.base_score,
                    best_score,
                    improved: outcome.best.is_some(),
                }))
                .await;
            if let Some(best) = outcome.best {
                draft = crate::compose::Draft::new(best.answer);
            }
        }

        // Stream the draft fragments. Tokens are never retracted.
        let fragments = draft.fragments();
        for fragment in &fragments {
            events
                .emit(Event::Token(TokenPayload {
                    text: format!("{fragment} "),
                }))
                .await;
        }

        let step_score = self.score_step(params, policy, pack, ledger, &draft.text, &[], 0)?;
        events
            .emit(Event::Score(ScorePayload {
                s1: step_score.s1,
                s2: step_score.verdict.s2,
                final_score: step_score.score,
                cp_accept: step_score.decision.cp_accept,
                cp_tau: step_score.decision.cp_tau,
            }))
            .await;

        let step = StepTrace {
            step_index: 0,
            is_refinement: false,
            s1: step_score.s1,
            s2: step_score.verdict.s2,
            final_score: step_score.score,
            cp_accept: step_score.decision.cp_accept,
            issues: step_score.verdict.issues.clone(),
            tools_used: Vec::new(),
            action: step_score.decision.action,
            reason: "initial".to_string(),
            change_summary: None,
            latency_ms: 0,
        };
        events
            .emit(Event::Trace(TracePayload {
                step: 0,
                is_refinement: false,
                issues: step.issues.iter().map(|i| i.kind.as_str().to_string()).collect(),
                tools_used: Vec::new(),
                prompt_preview: None,
                change_summary: None,
            }))
            .await;

        let usage = Usage {
            draft_tokens: fragments.len(),
            paraphrase_samples: step_score.sample_count,
            tool_calls: 0,
            refinements: 0,
        };
        Ok(RunState {
            answer: draft.text,
            s1: step_score.s1,
            s2: step_score.verdict.s2,
            score: step_score.score,
            needs_fix: step_score.verdict.needs_fix,
            issues: step_score.verdict.issues,
            decision: step_score.decision,
            trace: vec![step],
            tools_used_total: Vec::new(),
            usage,
        })
    }

    fn decision_config(&self, policy: &RequestPolicy) -> DecisionConfig {
        DecisionConfig {
            w1: policy.score_weight_s1,
            w2: policy.score_weight_s2,
            tau_accept: policy.accept_threshold,
            delta: policy.borderline_delta,
        }
    }

    fn score_step(
        &self,
        params: &AskParams,
        policy: &RequestPolicy,
        pack: &Pack,
        ledger: &PcnLedger,
        answer: &str,
        gov_failures: &[String],
        refinement_index: u32,
    ) -> Result<StepScore> {
        let snippets = pack.snippets(3);
        let samples = sampling::answer_variants(
            answer,
            &params.question,
            &snippets,
            policy.snne_samples,
        );
        let raw = snne::snne_raw(&samples, policy.snne_tau, self.retriever.embedder().as_ref());
        let mut s1 = match raw {
            Some(raw) => self.calibrator.normalize(&policy.domain, raw),
            None => {
                warn!("single-sample uncertainty reading treated as maximum uncertainty");
                0.0
            }
        };

        let pending = ledger.pending_in(answer);
        let ctx = VerifyContext {
            pack: Some(pack),
            pending_placeholders: &pending,
            gov_failures,
            // Claim faithfulness is judged against the retrieved pack, so
            // it only applies to the initial draft; refined drafts mix in
            // tool evidence the pack does not contain.
            faithfulness_enabled: policy.faithfulness_enabled && refinement_index == 0,
            faithfulness_threshold: policy.faithfulness_threshold,
        };
        let mut verdict = self.verifier.verify(&params.question, answer, &ctx);

        if verdict.needs_fix {
            s1 = (s1 - 0.1 * verdict.issues.len() as f64).max(0.0);
        }
        let cfg = self.decision_config(policy);
        let score = final_score(s1, verdict.s2, &cfg);

        // Conformal gate.
        let (cp_accept, cp_tau) = if policy.cp_enabled {
            let (entry, _) = self
                .thresholds
                .lookup(&self.pool, &self.settings, &policy.domain)?;
            match entry.tau {
                Some(tau) => (Some(score >= tau), Some(tau)),
                None => {
                    if !verdict
                        .issues
                        .iter()
                        .any(|i| i.kind == IssueKind::CpMissingCalibration)
                    {
                        verdict
                            .issues
                            .push(Issue::new(IssueKind::CpMissingCalibration));
                    }
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let refinements_left = refinement_index < policy.max_refinements;
        let decision = decide(score, &cfg, cp_accept, cp_tau, refinements_left, &verdict.issues);
        Ok(StepScore {
            s1,
            raw,
            sample_count: samples.len(),
            verdict,
            score,
            decision,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn refinement_iteration(
        &self,
        params: &AskParams,
        request_id: &str,
        policy: &RequestPolicy,
        pack: &Pack,
        ledger: &mut PcnLedger,
        state: &mut RunState,
        turn_remaining: &mut u32,
        session_approved: &mut HashSet<ToolName>,
        context_snips: &mut Vec<String>,
        candidate_urls: &[String],
        iteration: u32,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<IterationOutcome> {
        let mut ref_remaining = policy.tool_budget_per_refinement.min(*turn_remaining);
        let mut tools_used: Vec<ToolName> = Vec::new();
        let mut tool_meta: Vec<serde_json::Value> = Vec::new();
        let mut new_issues: Vec<Issue> = Vec::new();

        let has_issue =
            |issues: &[Issue], kind: IssueKind| issues.iter().any(|i| i.kind == kind);

        let mut fetch_url: Option<String> = None;
        let mut fetch_snippet: Option<String> = None;
        let mut math_value: Option<f64> = None;
        let mut math_placeholders: Vec<String> = Vec::new();
        let mut table_summary: Option<String> = None;
        let mut table_numeric: Option<f64> = None;
        let mut table_rows: Option<usize> = None;
        let mut gov_failing: Vec<String> = Vec::new();

        // ── WEB_SEARCH: exploratory evidence when grounding is thin ──
        if ref_remaining > 0
            && *turn_remaining > 0
            && (has_issue(&state.issues, IssueKind::MissingEvidence)
                || has_issue(&state.issues, IssueKind::MissingCitations)
                || has_issue(&state.issues, IssueKind::UnsupportedClaim))
        {
            let gate = self
                .gate_tool(
                    ToolName::WebSearch,
                    policy,
                    session_approved,
                    request_id,
                    json!({"question_preview": preview(&params.question)}),
                    ToolMeta {
                        k: Some(3),
                        ..Default::default()
                    },
                    events,
                    &mut new_issues,
                )
                .await;
            if gate {
                self.emit_tool(events, ToolName::WebSearch, ToolStatus::Start, None, ToolMeta {
                    k: Some(3),
                    ref_remaining: Some(ref_remaining),
                    turn_remaining: Some(*turn_remaining),
                        ..Default::default()
})
                .await;
                self.metrics.tool_start.inc();
                match web_search::search(&params.question, 3) {
                    Ok(results) => {
                        charge(&mut ref_remaining, turn_remaining);
                        tools_used.push(ToolName::WebSearch);
                        state.usage.tool_calls += 1;
                        if let Some(top) = results.first() {
                            context_snips.insert(0, top.snippet.clone());
                            if fetch_url.is_none() && !top.url.is_empty() {
                                fetch_url = Some(top.url.clone());
                            }
                        }
                        tool_meta.push(json!({
                            "tool": "WEB_SEARCH", "results": results.len()
                        }));
                        self.emit_tool(
                            events,
                            ToolName::WebSearch,
                            ToolStatus::Stop,
                            None,
                            ToolMeta {
                                k: Some(3),
                                ref_remaining: Some(ref_remaining),
                                turn_remaining: Some(*turn_remaining),
                                ..Default::default()
                            },
                        )
                        .await;
                    }
                    Err(e) => {
                        self.metrics.tool_error.inc();
                        self.emit_tool(
                            events,
                            ToolName::WebSearch,
                            ToolStatus::Error,
                            None,
                            ToolMeta::reason(e.to_string()),
                        )
                        .await;
                    }
                }
            }
        }

        // ── WEB_FETCH: citations from pack-provided urls ──
        if has_issue(&state.issues, IssueKind::MissingCitations)
            && ref_remaining > 0
            && *turn_remaining > 0
        {
            let url_candidate = fetch_url.clone().or_else(|| {
                candidate_urls
                    .get(((iteration - 1) as usize).min(candidate_urls.len().saturating_sub(1)))
                    .cloned()
            });
            if let Some(url) = url_candidate {
                let gate = self
                    .gate_tool(
                        ToolName::WebFetch,
                        policy,
                        session_approved,
                        request_id,
                        json!({"url": url}),
                        ToolMeta {
                            url: Some(url.clone()),
                            ..Default::default()
                        },
                        events,
                        &mut new_issues,
                    )
                    .await;
                if gate {
                    self.emit_tool(
                        events,
                        ToolName::WebFetch,
                        ToolStatus::Start,
                        None,
                        ToolMeta {
                            url: Some(url.clone()),
                            ref_remaining: Some(ref_remaining),
                            turn_remaining: Some(*turn_remaining),
                            ..Default::default()
                        },
                    )
                    .await;
                    self.metrics.tool_start.inc();
                    match web_fetch::fetch(&url, &policy.egress).await {
                        Ok(result) => {
                            charge(&mut ref_remaining, turn_remaining);
                            tools_used.push(ToolName::WebFetch);
                            state.usage.tool_calls += 1;
                            fetch_snippet = Some(preview(&result.text));
                            fetch_url = Some(result.url.clone());

                            let pcn_id = Uuid::new_v4().to_string();
                            let pending = ledger.register(
                                &pcn_id,
                                PcnPolicy::default(),
                                Provenance::Url {
                                    url: result.url.clone(),
                                },
                            );
                            events.emit(Event::Pcn(pending)).await;
                            let verified = ledger.verify_url(&pcn_id, &result.url);
                            events.emit(Event::Pcn(verified)).await;

                            tool_meta.push(json!({
                                "tool": "WEB_FETCH",
                                "url": result.url,
                                "status": result.meta.status,
                                "bytes": result.meta.bytes,
                            }));
                            self.emit_tool(
                                events,
                                ToolName::WebFetch,
                                ToolStatus::Stop,
                                None,
                                result.meta,
                            )
                            .await;
                        }
                        Err(e) if e.kind == ToolErrorKind::InjectionBlocked => {
                            self.metrics.tool_blocked.inc();
                            if !has_issue(&new_issues, IssueKind::InjectionSuspected) {
                                new_issues.push(Issue::new(IssueKind::InjectionSuspected));
                            }
                            self.emit_tool(
                                events,
                                ToolName::WebFetch,
                                ToolStatus::Blocked,
                                None,
                                ToolMeta {
                                    url: Some(url.clone()),
                                    injection_blocked: Some(true),
                                    reason: Some(e.to_string()),
                                    ..Default::default()
                                },
                            )
                            .await;
                        }
                        Err(e) => {
                            self.metrics.tool_error.inc();
                            self.emit_tool(
                                events,
                                ToolName::WebFetch,
                                ToolStatus::Error,
                                None,
                                ToolMeta {
                                    url: Some(url.clone()),
                                    reason: Some(e.to_string()),
                                    ..Default::default()
                                },
                            )
                            .await;
                        }
                    }
                }
            }
        }

        // ── MATH_EVAL: ground numeric expectations ──
        if has_issue(&state.issues, IssueKind::MissingNumbers)
            && !has_issue(&state.issues, IssueKind::MissingTableData)
            && ref_remaining > 0
            && *turn_remaining > 0
        {
            let target = fetch_snippet
                .clone()
                .or_else(|| context_snips.first().cloned())
                .unwrap_or_else(|| params.question.clone());
            let expr = extract_number(&target)
                .map(|n| format!("{n}"))
                .unwrap_or_else(|| "1+1".to_string());
            let gate = self
                .gate_tool(
                    ToolName::MathEval,
                    policy,
                    session_approved,
                    request_id,
                    json!({"expr": expr}),
                    ToolMeta {
                        expr: Some(expr.clone()),
                        ..Default::default()
                    },
                    events,
                    &mut new_issues,
                )
                .await;
            if gate {
                self.emit_tool(
                    events,
                    ToolName::MathEval,
                    ToolStatus::Start,
                    None,
                    ToolMeta {
                        expr: Some(expr.clone()),
                        ref_remaining: Some(ref_remaining),
                        turn_remaining: Some(*turn_remaining),
                        ..Default::default()
                    },
                )
                .await;
                self.metrics.tool_start.inc();
                match math_eval::evaluate(&expr) {
                    Ok(value) => {
                        charge(&mut ref_remaining, turn_remaining);
                        tools_used.push(ToolName::MathEval);
                        state.usage.tool_calls += 1;

                        let pcn_id = Uuid::new_v4().to_string();
                        let policy_pcn = PcnPolicy {
                            tolerance: Some(0.0),
                            units: params.math_units.clone(),
                            ..Default::default()
                        };
                        let pending = ledger.register(
                            &pcn_id,
                            policy_pcn,
                            Provenance::Math { expr: expr.clone() },
                        );
                        events.emit(Event::Pcn(pending)).await;
                        let verify_event = ledger.verify_math(&pcn_id, &expr, value);
                        if verify_event
                            .reason
                            .as_deref()
                            .is_some_and(|r| r.contains("invalid_units"))
                            && !has_issue(&new_issues, IssueKind::UnitMismatch)
                        {
                            new_issues.push(Issue::new(IssueKind::UnitMismatch));
                        }
                        events.emit(Event::Pcn(verify_event)).await;
                        math_value = Some(value);
                        math_placeholders.push(PcnLedger::placeholder(&pcn_id));

                        tool_meta.push(json!({"tool": "MATH_EVAL", "expr": expr}));
                        self.emit_tool(
                            events,
                            ToolName::MathEval,
                            ToolStatus::Stop,
                            None,
                            ToolMeta {
                                expr: Some(expr.clone()),
                                ref_remaining: Some(ref_remaining),
                                turn_remaining: Some(*turn_remaining),
                                ..Default::default()
                            },
                        )
                        .await;
                    }
                    Err(e) => {
                        self.metrics.tool_error.inc();
                        self.emit_tool(
                            events,
                            ToolName::MathEval,
                            ToolStatus::Error,
                            None,
                            ToolMeta {
                                expr: Some(expr.clone()),
                                reason: Some(e.to_string()),
                                ..Default::default()
                            },
                        )
                        .await;
                    }
                }
            }
        }

        // ── TABLE_QUERY: reconcile governed datasets ──
        let wants_table = has_issue(&state.issues, IssueKind::MissingTableData)
            || (policy.table_query_sql.is_some()
                && has_issue(&state.issues, IssueKind::MissingNumbers));
        if wants_table && ref_remaining > 0 && *turn_remaining > 0 {
            let sql_candidate = policy
                .table_query_sql
                .clone()
                .or_else(|| guess_table_sql(&params.question, context_snips));
            if let Some(sql) = sql_candidate {
                let gate = self
                    .gate_tool(
                        ToolName::TableQuery,
                        policy,
                        session_approved,
                        request_id,
                        json!({"sql": sql}),
                        ToolMeta {
                            sql: Some(sql.clone()),
                            ..Default::default()
                        },
                        events,
                        &mut new_issues,
                    )
                    .await;
                if gate {
                    self.emit_tool(
                        events,
                        ToolName::TableQuery,
                        ToolStatus::Start,
                        None,
                        ToolMeta {
                            sql: Some(sql.clone()),
                            ref_remaining: Some(ref_remaining),
                            turn_remaining: Some(*turn_remaining),
                            ..Default::default()
                        },
                    )
                    .await;
                    self.metrics.tool_start.inc();
                    let result = {
                        let conn = self.pool.get()?;
                        let limits = QueryLimits {
                            max_rows: policy.table_query_max_rows,
                            time_limit_ms: policy.table_query_time_limit_ms,
                            rate_limit_per_minute: policy.table_rate_limit_per_minute,
                            table_allowed: &policy.table_allowed,
                            table_policies: &policy.table_policies,
                        };
                        table_query::query(&conn, &sql, &[], &limits, &self.rate_limiter)
                    };
                    match result {
                        Ok(table) => {
                            charge(&mut ref_remaining, turn_remaining);
                            tools_used.push(ToolName::TableQuery);
                            state.usage.tool_calls += 1;
                            table_rows = Some(table.rows.len());
                            let mut summary = table.summary(3);

                            let mut pcn_token: Option<String> = None;
                            if let Some(numeric) = table.first_numeric() {
                                let pcn_id = Uuid::new_v4().to_string();
                                let pending = ledger.register(
                                    &pcn_id,
                                    PcnPolicy {
                                        tolerance: Some(0.0),
                                        ..Default::default()
                                    },
                                    Provenance::Sql {
                                        sql_hash: sql_hash(&sql),
                                    },
                                );
                                events.emit(Event::Pcn(pending)).await;
                                let verify_event = ledger.verify_sql(&pcn_id, numeric);
                                events.emit(Event::Pcn(verify_event)).await;
                                table_numeric = Some(numeric);
                                let token = PcnLedger::placeholder(&pcn_id);
                                summary = format!("{summary} (verified {token})");
                                pcn_token = Some(token);
                            }
                            if !table.policy_checks.is_empty() {
                                gov_failing.extend(table.policy_checks.clone());
                            }

                            // GoV: executed-query premise supports the row
                            // claim through the minted PCN.
                            let dag = Dag {
                                nodes: vec![
                                    DagNode {
                                        id: "sql".to_string(),
                                        node_type: NodeType::Premise,
                                        text: Some(format!("Executed {sql}")),
                                        pcn: pcn_token
                                            .as_ref()
                                            .map(|t| trim_placeholder(t)),
                                    },
                                    DagNode {
                                        id: "result".to_string(),
                                        node_type: NodeType::Claim,
                                        text: Some(format!(
                                            "Returned {} row(s)",
                                            table.rows.len()
                                        )),
                                        pcn: None,
                                    },
                                ],
                                edges: vec![DagEdge {
                                    from: "sql".to_string(),
                                    to: "result".to_string(),
                                }],
                            };
                            let (gov_ok, failing) =
                                gov::evaluate_dag(&dag, |id| ledger.status_of(id));
                            if !gov_ok {
                                gov_failing.extend(failing.clone());
                                self.metrics.gov_failures.add(failing.len() as u64);
                            }
                            events
                                .emit(Event::Gov(GovPayload {
                                    dag_delta: DagDelta {
                                        ok: gov_ok,
                                        failing,
                                    },
                                }))
                                .await;

                            table_summary = Some(summary);
                            context_snips.insert(
                                0,
                                format!("SQL[{sql}] -> {}", table.summary(3)),
                            );
                            tool_meta.push(json!({
                                "tool": "TABLE_QUERY",
                                "sql": sql,
                                "rows": table.rows.len(),
                                "policy_checks": table.policy_checks,
                            }));
                            self.emit_tool(
                                events,
                                ToolName::TableQuery,
                                ToolStatus::Stop,
                                None,
                                ToolMeta {
                                    sql: Some(sql.clone()),
                                    rows: table_rows,
                                    ..Default::default()
                                },
                            )
                            .await;
                        }
                        Err(e) => {
                            self.metrics.tool_error.inc();
                            let guard_violation = matches!(
                                e.kind,
                                ToolErrorKind::NotSelect
                                    | ToolErrorKind::ForbiddenConstruct
                                    | ToolErrorKind::TableNotAllowed
                            );
                            if guard_violation
                                && !has_issue(&new_issues, IssueKind::SqlViolation)
                            {
                                new_issues.push(Issue::with_detail(
                                    IssueKind::SqlViolation,
                                    e.kind.as_str(),
                                ));
                            }
                            self.emit_tool(
                                events,
                                ToolName::TableQuery,
                                ToolStatus::Error,
                                None,
                                ToolMeta {
                                    sql: Some(sql.clone()),
                                    reason: Some(e.to_string()),
                                    ..Default::default()
                                },
                            )
                            .await;
                        }
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(EngineError::internal("request cancelled"));
        }

        // Issues cleared by this iteration's tool results.
        let mut issues_remaining: Vec<Issue> = state.issues.clone();
        issues_remaining.retain(|issue| match issue.kind {
            IssueKind::MissingCitations => fetch_url.is_none(),
            IssueKind::MissingNumbers => math_value.is_none() && table_numeric.is_none(),
            IssueKind::MissingTableData => table_rows.is_none(),
            IssueKind::MissingEvidence => {
                fetch_snippet.is_none() && table_rows.is_none() && context_snips.is_empty()
            }
            _ => true,
        });

        // Governance failures for work that could not verify.
        if fetch_url.is_none()
            && has_issue(&state.issues, IssueKind::MissingCitations)
            && has_issue(&issues_remaining, IssueKind::MissingCitations)
        {
            gov_failing.push("missing_citation_provenance".to_string());
        }
        if math_value.is_none()
            && has_issue(&state.issues, IssueKind::MissingNumbers)
            && has_issue(&issues_remaining, IssueKind::MissingNumbers)
        {
            gov_failing.push("missing_pcn_verification".to_string());
        }

        // Compose the refined draft.
        let mut iteration_context = context_snips.clone();
        if let Some(snippet) = &fetch_snippet {
            iteration_context.insert(0, snippet.clone());
        }
        if let Some(summary) = &table_summary {
            iteration_context.insert(0, format!("TABLE_QUERY: {summary}"));
        }
        let refine_ctx = RefinementContext {
            previous_answer: state.answer.clone(),
            issues_remaining: issues_remaining
                .iter()
                .map(|i| i.kind.as_str().to_string())
                .collect(),
            context_snippets: iteration_context.clone(),
            fetch_url: fetch_url.clone(),
            math_text: (!math_placeholders.is_empty()).then(|| {
                let joined = math_placeholders.join(", ");
                match &params.math_units {
                    Some(units) => format!("{joined} {units}"),
                    None => joined,
                }
            }),
            table_text: table_summary.clone(),
        };
        let refined = self.composer.refined_draft(&params.question, &refine_ctx);
        *context_snips = iteration_context.into_iter().take(3).collect();

        if !gov_failing.is_empty() {
            events
                .emit(Event::Gov(GovPayload {
                    dag_delta: DagDelta {
                        ok: false,
                        failing: gov_failing.clone(),
                    },
                }))
                .await;
        }

        // Re-score the refined draft.
        let step_score = self.score_step(
            params,
            policy,
            pack,
            ledger,
            &refined.text,
            &gov_failing,
            iteration,
        )?;
        state.usage.paraphrase_samples += step_score.sample_count;

        let mut issues = step_score.verdict.issues.clone();
        for issue in new_issues {
            if !issues.iter().any(|i| i.kind == issue.kind) {
                issues.push(issue);
            }
        }

        events
            .emit(Event::Score(ScorePayload {
                s1: step_score.s1,
                s2: step_score.verdict.s2,
                final_score: step_score.score,
                cp_accept: step_score.decision.cp_accept,
                cp_tau: step_score.decision.cp_tau,
            }))
            .await;

        let resolved: Vec<&Issue> = state
            .issues
            .iter()
            .filter(|old| !issues.iter().any(|new| new.kind == old.kind))
            .collect();
        let mut change_parts: Vec<String> = Vec::new();
        if !resolved.is_empty() {
            change_parts.push(format!(
                "resolved: {}",
                resolved
                    .iter()
                    .map(|i| i.kind.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        if !tools_used.is_empty() {
            change_parts.push(format!(
                "tools: {}",
                tools_used
                    .iter()
                    .map(|t| t.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        if let Some(url) = &fetch_url {
            change_parts.push(format!("source: {url}"));
        }
        if let Some(value) = math_value {
            change_parts.push(format!("calc: {value}"));
        }
        if let Some(rows) = table_rows {
            change_parts.push(format!("table_rows: {rows}"));
        }
        let change_summary = if change_parts.is_empty() {
            "no changes".to_string()
        } else {
            change_parts.join("; ")
        };

        let prompt_preview: String = build_refinement_prompt(&params.question, &refine_ctx)
            .chars()
            .take(240)
            .collect();
        let step = StepTrace {
            step_index: iteration as usize,
            is_refinement: true,
            s1: step_score.s1,
            s2: step_score.verdict.s2,
            final_score: step_score.score,
            cp_accept: step_score.decision.cp_accept,
            issues: issues.clone(),
            tools_used: tools_used.clone(),
            action: step_score.decision.action,
            reason: "refined iteration".to_string(),
            change_summary: Some(change_summary.clone()),
            latency_ms: 0,
        };
        events
            .emit(Event::Trace(TracePayload {
                step: iteration as usize,
                is_refinement: true,
                issues: issues.iter().map(|i| i.kind.as_str().to_string()).collect(),
                tools_used: tools_used.clone(),
                prompt_preview: Some(prompt_preview.clone()),
                change_summary: Some(change_summary),
            }))
            .await;

        let stalled = tools_used.is_empty() && resolved.is_empty();
        // Raw + normalized uncertainty travel with the audit trace for
        // drift tracking.
        tool_meta.push(json!({
            "uq": {"raw": step_score.raw, "s1": step_score.s1, "samples": step_score.sample_count}
        }));
        let trace_json = Some(audit::trace_json(&step, &tool_meta, Some(&prompt_preview)));

        // Adopt the refined step.
        state.answer = refined.text;
        state.s1 = step_score.s1;
        state.s2 = step_score.verdict.s2;
        state.score = step_score.score;
        state.needs_fix = step_score.verdict.needs_fix || !issues.is_empty();
        state.issues = issues;
        state.decision = step_score.decision;
        state.trace.push(step);
        for tool in tools_used {
            if !state.tools_used_total.contains(&tool) {
                state.tools_used_total.push(tool);
            }
        }

        Ok(IterationOutcome { stalled, trace_json })
    }

    /// Allowlist and approval gate for one tool. Returns true when the
    /// tool may execute. Blocked or denied calls emit their events here
    /// and charge nothing.
    #[allow(clippy::too_many_arguments)]
    async fn gate_tool(
        &self,
        tool: ToolName,
        policy: &RequestPolicy,
        session_approved: &mut HashSet<ToolName>,
        request_id: &str,
        context: serde_json::Value,
        meta: ToolMeta,
        events: &EventSender,
        issues: &mut Vec<Issue>,
    ) -> bool {
        if !policy.tool_allowed(tool) {
            self.metrics.tool_blocked.inc();
            self.emit_tool(
                events,
                tool,
                ToolStatus::Blocked,
                None,
                ToolMeta {
                    reason: Some("not_allowed".to_string()),
                    ..meta
                },
            )
            .await;
            return false;
        }
        if policy.tools_requiring_approval.contains(&tool) && !session_approved.contains(&tool) {
            let approval_id = self.approvals.create(request_id, tool.as_str(), context);
            self.emit_tool(
                events,
                tool,
                ToolStatus::WaitingApproval,
                Some(approval_id.clone()),
                meta,
            )
            .await;
            match self.approvals.wait(&approval_id).await {
                ApprovalState::Approved => {
                    session_approved.insert(tool);
                    return true;
                }
                ApprovalState::Denied => {
                    self.metrics.tool_blocked.inc();
                    issues.push(Issue::new(IssueKind::ApprovalDenied));
                    self.emit_tool(
                        events,
                        tool,
                        ToolStatus::Blocked,
                        Some(approval_id),
                        ToolMeta::reason("approval_denied"),
                    )
                    .await;
                    return false;
                }
                ApprovalState::Expired | ApprovalState::Pending => {
                    self.metrics.tool_blocked.inc();
                    issues.push(Issue::new(IssueKind::ApprovalExpired));
                    self.emit_tool(
                        events,
                        tool,
                        ToolStatus::Blocked,
                        Some(approval_id),
                        ToolMeta::reason("approval_expired"),
                    )
                    .await;
                    return false;
                }
            }
        }
        true
    }

    async fn emit_tool(
        &self,
        events: &EventSender,
        name: ToolName,
        status: ToolStatus,
        id: Option<String>,
        meta: ToolMeta,
    ) {
        events
            .emit(Event::Tool(ToolPayload {
                name,
                status,
                id,
                meta,
            }))
            .await;
    }

    fn persist_step(
        &self,
        request_id: &str,
        params: &AskParams,
        policy: &RequestPolicy,
        state: &RunState,
        pack_ids: &[String],
        status: &str,
        trace_json: Option<String>,
    ) {
        let Some(step) = state.trace.last() else {
            return;
        };
        let audit = StepAudit {
            request_id,
            domain: &policy.domain,
            question: &params.question,
            answer: &state.answer,
            status,
            step,
            pack_ids,
            trace_json,
        };
        if let Err(e) = audit::persist_step(&self.pool, &audit) {
            warn!(error = %e, "step audit failed");
        }
    }
}

struct IterationOutcome {
    stalled: bool,
    trace_json: Option<String>,
}

fn charge(ref_remaining: &mut u32, turn_remaining: &mut u32) {
    *ref_remaining = ref_remaining.saturating_sub(1);
    *turn_remaining = turn_remaining.saturating_sub(1);
}

fn preview(text: &str) -> String {
    text.chars().take(240).collect()
}

fn extract_number(text: &str) -> Option<f64> {
    let mut current = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() || (c == '.' && !current.is_empty() && !current.contains('.')) {
            current.push(c);
        } else if !current.is_empty() {
            break;
        }
    }
    current.trim_end_matches('.').parse().ok()
}

fn trim_placeholder(token: &str) -> String {
    token
        .strip_prefix("[PCN:")
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(token)
        .to_string()
}

fn sql_hash(sql: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest.chars().take(16).collect()
}

/// Heuristic SQL for table-shaped questions when no override is given.
fn guess_table_sql(question: &str, context: &[String]) -> Option<String> {
    let q = question.to_lowercase();
    let ctx = context.join(" ").to_lowercase();
    if q.contains("demo") || ctx.contains("demo") {
        if ["count", "number", "patients", "rows"].iter().any(|t| q.contains(t)) {
            return Some("select count(*) as count from demo".to_string());
        }
        if ["list", "show", "records"].iter().any(|t| q.contains(t)) {
            return Some("select * from demo limit 5".to_string());
        }
    }
    if q.contains("cohort") && q.contains("count") {
        return Some("select cohort, count(*) as count from demo group by cohort".to_string());
    }
    None
}
