//! Transport-agnostic API surface
//!
//! Typed request/response handlers the web layer (an external
//! collaborator) calls into: ask, ask-stream, approvals, calibration,
//! audit queries, metrics, and GoV checks. No HTTP types appear here;
//! a thin adapter maps routes onto these methods.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use attest_protocol::{AgentResult, Event, ReadyPayload, ToolStatus};
use attest_retrieval::Retriever;

use crate::approvals::{self, ApprovalState, ApprovalsStore};
use crate::compose::ExtractiveComposer;
use crate::config::Settings;
use crate::errors::{EngineError, Result};
use crate::gov::{self, Dag};
use crate::metrics::{Metrics, MetricsJson};
use crate::orchestrator::{AskParams, Engine};
use crate::pcn::PcnStatus;
use crate::policy::cp::ThresholdTable;
use crate::policy::drift;
use crate::storage::steps::{StepFilter, StepRecord};
use crate::storage::{self, cp as cp_store, steps, ttl, DbPool};
use crate::stream::{self, EventSender, DEFAULT_EVENT_BUFFER};
use crate::verify::Verifier;

/// Non-stream ask outcome: either the final result or a pending
/// approval the caller should surface as 202.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AskOutcome {
    Completed { result: AgentResult },
    WaitingApproval { approval_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproveRequest {
    pub approval_id: String,
    pub approved: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdResponse {
    pub domain: String,
    pub tau: Option<f64>,
    pub stats: cp_store::DomainStats,
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactImport {
    pub run_id: String,
    pub domain: String,
    pub items: Vec<cp_store::Artifact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovCheckRequest {
    pub dag: Dag,
    #[serde(default)]
    pub verified_pcn: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovCheckResponse {
    pub ok: bool,
    pub failures: Vec<String>,
}

struct CachedResult {
    result: AgentResult,
    stored_at: Instant,
}

/// Idempotency cache for completed results, TTL-bound.
#[derive(Default)]
struct IdempotencyStore {
    entries: Mutex<HashMap<String, CachedResult>>,
}

impl IdempotencyStore {
    fn get(&self, key: &str, ttl: Duration) -> Option<AgentResult> {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match entries.get(key) {
            Some(cached) if cached.stored_at.elapsed() < ttl => Some(cached.result.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: &str, result: AgentResult, ttl: Duration) {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.len() > 2048 {
            entries.retain(|_, cached| cached.stored_at.elapsed() < ttl);
        }
        entries.insert(
            key.to_string(),
            CachedResult {
                result,
                stored_at: Instant::now(),
            },
        );
    }
}

/// Engine plus background tasks, built at startup after migrations and
/// torn down by cancelling the runtime token.
pub struct EngineRuntime {
    pub engine: Arc<Engine>,
    cancel: CancellationToken,
    idempotency: Arc<IdempotencyStore>,
    idempotency_ttl: Duration,
}

impl EngineRuntime {
    /// Initialize storage, run migrations, and start the sweepers.
    pub fn start(settings: Settings) -> Result<Self> {
        let pool = storage::initialize_pool(Path::new(&settings.db_path), 8)?;
        Self::start_with_pool(settings, pool)
    }

    pub fn start_with_pool(settings: Settings, pool: DbPool) -> Result<Self> {
        let cancel = CancellationToken::new();
        let approvals = Arc::new(ApprovalsStore::new(Duration::from_secs(
            settings.approvals_ttl_seconds,
        )));
        let metrics = Arc::new(Metrics::default());
        let thresholds = Arc::new(ThresholdTable::new());

        // Background maintenance; handles detach and stop on cancel.
        let _ = ttl::spawn_sweeper(pool.clone(), settings.clone(), cancel.clone());
        let _ = approvals::spawn_sweeper(
            Arc::clone(&approvals),
            Duration::from_secs(60),
            cancel.clone(),
        );

        let engine = Arc::new(Engine::new(
            settings,
            pool,
            Retriever::hash_default(),
            Arc::new(ExtractiveComposer),
            Arc::new(Verifier::new()),
            approvals,
            thresholds,
            metrics,
        ));
        let idempotency_ttl =
            Duration::from_secs(engine.settings().idempotency_ttl_seconds.max(1));
        Ok(Self {
            engine,
            cancel,
            idempotency: Arc::new(IdempotencyStore::default()),
            idempotency_ttl,
        })
    }

    /// Cancel background tasks. In-flight requests finish on their own.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// POST /agent/answer
    ///
    /// Runs the request to completion, except that the first pending
    /// approval returns `WaitingApproval` while the request keeps
    /// running in the background; its final result lands in the
    /// idempotency cache for replay.
    pub async fn ask(&self, mut params: AskParams) -> Result<AskOutcome> {
        if let Some(key) = params.idempotency_key.clone() {
            if let Some(cached) = self.idempotency.get(&key, self.idempotency_ttl) {
                self.engine.metrics.idempotent_replays.inc();
                return Ok(AskOutcome::Completed { result: cached });
            }
        }
        if params.request_id.is_none() {
            params.request_id = Some(Uuid::new_v4().to_string());
        }

        let (events, mut rx) = EventSender::channel(DEFAULT_EVENT_BUFFER);
        let engine = Arc::clone(&self.engine);
        let idempotency = Arc::clone(&self.idempotency);
        let idempotency_ttl = self.idempotency_ttl;
        let key = params.idempotency_key.clone();
        let cancel = self.cancel.child_token();
        let task = tokio::spawn(async move {
            let result = engine.answer(params, events, cancel).await;
            if let (Ok(result), Some(key)) = (&result, key) {
                idempotency.put(&key, result.clone(), idempotency_ttl);
            }
            result
        });

        // Surface the first pending approval without waiting for it.
        enum FirstSignal {
            Approval(String),
            Done(AgentResult),
            Ended,
        }
        let first = loop {
            match rx.recv().await {
                Some(Event::Tool(payload)) if payload.status == ToolStatus::WaitingApproval => {
                    if let Some(id) = payload.id {
                        break FirstSignal::Approval(id);
                    }
                }
                Some(Event::Final(result)) => break FirstSignal::Done(*result),
                Some(Event::Error(_)) | None => break FirstSignal::Ended,
                Some(_) => {}
            }
        };
        match first {
            FirstSignal::Approval(approval_id) => {
                // Keep draining so the producer never blocks.
                tokio::spawn(async move { while rx.recv().await.is_some() {} });
                Ok(AskOutcome::WaitingApproval { approval_id })
            }
            FirstSignal::Done(result) => {
                let _ = task.await;
                Ok(AskOutcome::Completed { result })
            }
            FirstSignal::Ended => match task.await {
                Ok(Ok(result)) => Ok(AskOutcome::Completed { result }),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(EngineError::internal_with_source("answer task panicked", e)),
            },
        }
    }

    /// POST /agent/answer/stream
    ///
    /// Returns a channel of SSE frames. An idempotency-key hit replays
    /// `ready` + `final` only.
    pub fn ask_stream(&self, mut params: AskParams) -> mpsc::Receiver<String> {
        let (frames_tx, frames_rx) = mpsc::channel(DEFAULT_EVENT_BUFFER);

        if let Some(key) = params.idempotency_key.clone() {
            if let Some(cached) = self.idempotency.get(&key, self.idempotency_ttl) {
                self.engine.metrics.idempotent_replays.inc();
                let request_id = cached.request_id.clone();
                tokio::spawn(async move {
                    let ready = Event::Ready(ReadyPayload { request_id });
                    for event in [ready, Event::Final(Box::new(cached))] {
                        match event.to_sse_frame() {
                            Ok(frame) => {
                                if frames_tx.send(frame).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "replay frame encoding failed");
                                return;
                            }
                        }
                    }
                });
                return frames_rx;
            }
        }

        if params.request_id.is_none() {
            params.request_id = Some(Uuid::new_v4().to_string());
        }
        let (events, rx) = EventSender::channel(DEFAULT_EVENT_BUFFER);
        let heartbeat = Duration::from_secs(self.engine.settings().heartbeat_seconds.max(1));
        let cancel = self.cancel.child_token();
        // The pump ends when the consumer goes away (or on the terminal
        // event); either way the request's token is cancelled, which
        // stops in-flight refinement at the next suspension point.
        let pump_cancel = cancel.clone();
        tokio::spawn(async move {
            stream::pump_sse(rx, frames_tx, heartbeat).await;
            pump_cancel.cancel();
        });

        let engine = Arc::clone(&self.engine);
        let idempotency = Arc::clone(&self.idempotency);
        let idempotency_ttl = self.idempotency_ttl;
        let key = params.idempotency_key.clone();
        tokio::spawn(async move {
            if let (Ok(result), Some(key)) =
                (engine.answer(params, events, cancel).await.as_ref(), key)
            {
                idempotency.put(&key, result.clone(), idempotency_ttl);
            }
        });
        frames_rx
    }

    /// POST /tools/approve
    pub fn approve(&self, request: &ApproveRequest) -> Result<ApprovalState> {
        self.engine
            .approvals
            .resolve(&request.approval_id, request.approved, request.reason.clone())
            .ok_or_else(|| EngineError::validation("unknown or expired approval_id"))
    }

    /// GET /cp/threshold?domain=...
    pub fn cp_threshold(&self, domain: &str) -> Result<ThresholdResponse> {
        let (entry, cached) =
            self.engine
                .thresholds
                .lookup(&self.engine.pool, self.engine.settings(), domain)?;
        Ok(ThresholdResponse {
            domain: domain.to_lowercase(),
            tau: entry.tau,
            stats: entry.stats,
            cached,
        })
    }

    /// POST /cp/artifacts: ingest rows, recompute tau, refresh the
    /// stored reference. Importing identical rows twice yields the same
    /// threshold.
    pub fn import_artifacts(&self, import: &ArtifactImport) -> Result<usize> {
        if import.items.is_empty() {
            return Err(EngineError::validation("no artifacts supplied"));
        }
        let settings = self.engine.settings();
        let conn = self.engine.pool.get()?;
        let count = cp_store::add_artifacts(&conn, &import.run_id, &import.domain, &import.items)?;
        self.engine.thresholds.invalidate(Some(&import.domain));

        let tau = cp_store::compute_threshold(
            &conn,
            &import.domain.to_lowercase(),
            settings.cp_target_mis,
            settings.cp_min_accepts,
        )?;
        let stats = cp_store::domain_stats(&conn, Some(&import.domain.to_lowercase()))?
            .remove(&import.domain.to_lowercase())
            .unwrap_or_default();
        let scores: Vec<f64> = import.items.iter().map(|a| a.score).collect();
        let quantiles =
            cp_store::quantiles_from_scores(&scores, &[0.1, 0.25, 0.5, 0.75, 0.9]);
        // Quantile shift against the stored baseline signals a scoring or
        // embedding change that invalidates calibration.
        if let Some(previous) = cp_store::get_reference(&conn, &import.domain.to_lowercase())? {
            let observed_drift = drift::compute_quantile_drift(
                &previous.snne_quantiles,
                &quantiles,
                import.items.len(),
            );
            if drift::needs_attention(
                &observed_drift,
                settings.snne_drift_quantile_tolerance,
                settings.snne_drift_min_samples,
            ) {
                warn!(
                    domain = %import.domain,
                    max_abs_delta = observed_drift.max_abs_delta,
                    "calibration quantile drift exceeds tolerance"
                );
            }
        }
        cp_store::upsert_reference(
            &conn,
            &cp_store::Reference {
                domain: import.domain.to_lowercase(),
                run_id: import.run_id.clone(),
                target_mis: settings.cp_target_mis,
                tau,
                stats,
                snne_quantiles: quantiles,
                updated: storage::now_epoch(),
            },
        )?;
        Ok(count)
    }

    /// GET /steps/recent
    pub fn recent_steps(&self, filter: &StepFilter) -> Result<Vec<StepRecord>> {
        let conn = self.engine.pool.get()?;
        steps::recent_steps(&conn, filter)
    }

    /// GET /steps/{id}
    pub fn step_detail(&self, id: &str) -> Result<Option<StepRecord>> {
        let conn = self.engine.pool.get()?;
        steps::get_step(&conn, id)
    }

    /// GET /metrics/prom
    pub fn metrics_prometheus(&self) -> String {
        let snapshot = self.engine.approvals.snapshot();
        self.engine.metrics.render_prometheus(&snapshot)
    }

    /// GET /metrics
    pub fn metrics_json(&self) -> MetricsJson {
        let snapshot = self.engine.approvals.snapshot();
        let settings = self.engine.settings();
        let calibration_alerts = self
            .engine
            .pool
            .get()
            .ok()
            .and_then(|conn| cp_store::domain_stats(&conn, None).ok())
            .map(|stats| drift::false_accept_alerts(&stats, settings.cp_target_mis, 0.02))
            .unwrap_or_default();
        self.engine
            .metrics
            .render_json(settings, &snapshot, calibration_alerts)
    }

    /// POST /gov/check
    pub fn gov_check(&self, request: &GovCheckRequest) -> GovCheckResponse {
        let verified: std::collections::HashSet<&str> =
            request.verified_pcn.iter().map(String::as_str).collect();
        let (ok, failures) = gov::evaluate_dag(&request.dag, |id| {
            if verified.contains(id) {
                Some(PcnStatus::Verified)
            } else {
                Some(PcnStatus::Pending)
            }
        });
        GovCheckResponse { ok, failures }
    }
}
