//! End-to-end orchestration scenarios
//!
//! Each test drives the engine through the public runtime surface and
//! asserts on the emitted event stream plus the final payload. Fixture
//! environment variables are serialized through a process-wide lock.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use tempfile::TempDir;

use attest_core::api::{ApproveRequest, ArtifactImport, AskOutcome, EngineRuntime};
use attest_core::config::Settings;
use attest_core::orchestrator::AskParams;
use attest_core::storage::steps::StepFilter;
use attest_core::storage::{self, corpus, cp, memory, workspaces, DbPool};

fn env_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    match LOCK.get_or_init(|| Mutex::new(())).lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Harness {
    runtime: EngineRuntime,
    pool: DbPool,
    _dir: TempDir,
}

fn harness(settings: Settings) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("attest.sqlite");
    let pool = storage::initialize_pool(&path, 4).expect("pool");
    let runtime = EngineRuntime::start_with_pool(settings, pool.clone()).expect("runtime");
    Harness {
        runtime,
        pool,
        _dir: dir,
    }
}

fn seed_corpus(pool: &DbPool, text: &str, title: &str, url: Option<&str>) -> String {
    let conn = pool.get().unwrap();
    corpus::add_doc(&conn, text, Some(title), url, None).unwrap()
}

/// Read SSE frames until the channel closes; returns (event, payload)
/// pairs.
async fn collect_frames(
    mut rx: tokio::sync::mpsc::Receiver<String>,
) -> Vec<(String, serde_json::Value)> {
    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        let mut name = String::new();
        let mut data = serde_json::Value::Null;
        for line in frame.lines() {
            if let Some(rest) = line.strip_prefix("event: ") {
                name = rest.to_string();
            } else if let Some(rest) = line.strip_prefix("data: ") {
                data = serde_json::from_str(rest).unwrap_or(serde_json::Value::Null);
            }
        }
        frames.push((name, data));
    }
    frames
}

fn names(frames: &[(String, serde_json::Value)]) -> Vec<&str> {
    frames.iter().map(|(n, _)| n.as_str()).collect()
}

fn final_payload(frames: &[(String, serde_json::Value)]) -> &serde_json::Value {
    &frames
        .iter()
        .find(|(n, _)| n == "final")
        .expect("final event present")
        .1
}

fn import_calibration(runtime: &EngineRuntime, domain: &str, tau_band: f64) {
    // Correct above the band, wrong below: the threshold search lands
    // near the band edge.
    let items: Vec<cp::Artifact> = (0..80)
        .map(|i| {
            let score = 0.3 + f64::from(i) * 0.008;
            cp::Artifact {
                score,
                accepted: true,
                correct: score >= tau_band,
            }
        })
        .collect();
    runtime
        .import_artifacts(&ArtifactImport {
            run_id: "seed".to_string(),
            domain: domain.to_string(),
            items,
        })
        .unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// S1: happy path accept
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn s1_happy_path_accept() {
    let settings = Settings {
        accept_threshold: 0.7,
        ..Default::default()
    };
    let h = harness(settings);
    seed_corpus(
        &h.pool,
        "X is Y.",
        "Definition",
        Some("https://docs.example.com/x"),
    );
    import_calibration(&h.runtime, "default", 0.7);

    let mut params = AskParams::question("What is X?");
    params.max_refinements = Some(0);
    let frames = collect_frames(h.runtime.ask_stream(params)).await;

    let ns = names(&frames);
    assert_eq!(ns.first(), Some(&"ready"));
    assert!(ns.contains(&"token"));
    assert!(ns.contains(&"score"));
    assert!(ns.contains(&"trace"));
    assert_eq!(ns.last(), Some(&"final"));
    assert_eq!(ns.iter().filter(|n| **n == "final" || **n == "error").count(), 1);

    let score = &frames.iter().find(|(n, _)| n == "score").unwrap().1;
    assert!(score["s1"].as_f64().unwrap() > 0.7);
    assert_eq!(score["cp_accept"], serde_json::json!(true));

    let result = final_payload(&frames);
    assert_eq!(result["action"], "accept");
    assert!(result["answer"].as_str().unwrap().contains("X is Y"));
    assert_eq!(result["cp_accept"], serde_json::json!(true));
    assert!(result["final_score"].as_f64().unwrap() >= 0.7);
    h.runtime.shutdown();
}

// ─────────────────────────────────────────────────────────────────────────────
// S2: borderline iterate with WEB_SEARCH/WEB_FETCH refinement
// ─────────────────────────────────────────────────────────────────────────────

fn write_fetch_fixture(dir: &TempDir, file: &str, body: &str) -> PathBuf {
    let path = dir.path().join(file);
    std::fs::write(&path, body).unwrap();
    path
}

#[tokio::test]
async fn s2_borderline_iterate_then_accept() {
    let _guard = env_lock();
    let fixture_dir = tempfile::tempdir().unwrap();
    write_fetch_fixture(
        &fixture_dir,
        "docs.example.com_slo.html",
        "<html>The uptime target is 99.9 percent, reviewed monthly.</html>",
    );
    let search_fixture = fixture_dir.path().join("search.json");
    std::fs::write(
        &search_fixture,
        serde_json::json!([{
            "title": "SLO handbook",
            "url": "https://docs.example.com/slo",
            "snippet": "uptime target documentation"
        }])
        .to_string(),
    )
    .unwrap();
    std::env::set_var("ATTEST_WEB_SEARCH_FIXTURE", &search_fixture);
    std::env::set_var("ATTEST_WEB_FETCH_FIXTURE_DIR", fixture_dir.path());

    let settings = Settings {
        cp_enabled: false,
        ..Default::default()
    };
    let h = harness(settings);
    seed_corpus(
        &h.pool,
        "The uptime target is reviewed by the platform team",
        "SLO notes",
        None,
    );

    let mut params = AskParams::question("What is the uptime target? Please cite the source.");
    params.accept_threshold = Some(0.9);
    params.borderline_delta = Some(0.35);
    let frames = collect_frames(h.runtime.ask_stream(params)).await;

    std::env::remove_var("ATTEST_WEB_SEARCH_FIXTURE");
    std::env::remove_var("ATTEST_WEB_FETCH_FIXTURE_DIR");

    let ns = names(&frames);
    let score_count = ns.iter().filter(|n| **n == "score").count();
    assert!(score_count >= 2, "expected refinement scores, got {ns:?}");

    let tool_events: Vec<&serde_json::Value> = frames
        .iter()
        .filter(|(n, _)| n == "tool")
        .map(|(_, d)| d)
        .collect();
    assert!(tool_events
        .iter()
        .any(|t| t["name"] == "WEB_SEARCH" && t["status"] == "start"));
    assert!(tool_events
        .iter()
        .any(|t| t["name"] == "WEB_SEARCH" && t["status"] == "stop"));

    let refinement_trace = frames
        .iter()
        .find(|(n, d)| n == "trace" && d["is_refinement"] == true);
    assert!(refinement_trace.is_some());

    let result = final_payload(&frames);
    assert_eq!(result["action"], "accept");
    assert!(result["answer"].as_str().unwrap().contains("https://docs.example.com/slo"));
    assert!(result["tools_used"]
        .as_array()
        .unwrap()
        .iter()
        .any(|t| t == "WEB_SEARCH"));
    h.runtime.shutdown();
}

// ─────────────────────────────────────────────────────────────────────────────
// S3: approval gating
// ─────────────────────────────────────────────────────────────────────────────

fn approval_settings() -> Settings {
    Settings {
        cp_enabled: false,
        tools_requiring_approval: vec!["WEB_SEARCH".to_string()],
        ..Default::default()
    }
}

fn borderline_citation_params() -> AskParams {
    let mut params = AskParams::question("What is the uptime target? Please cite the source.");
    params.accept_threshold = Some(0.9);
    params.borderline_delta = Some(0.35);
    params
}

#[tokio::test]
async fn s3_approval_granted_resumes_tool() {
    let _guard = env_lock();
    let search_dir = tempfile::tempdir().unwrap();
    write_fetch_fixture(
        &search_dir,
        "docs.example.com_slo.html",
        "<html>The uptime target is 99.9 percent, reviewed monthly.</html>",
    );
    let search_fixture = search_dir.path().join("search.json");
    std::fs::write(
        &search_fixture,
        serde_json::json!([{
            "title": "SLO handbook",
            "url": "https://docs.example.com/slo",
            "snippet": "uptime target is 99.9 percent"
        }])
        .to_string(),
    )
    .unwrap();
    std::env::set_var("ATTEST_WEB_SEARCH_FIXTURE", &search_fixture);
    std::env::set_var("ATTEST_WEB_FETCH_FIXTURE_DIR", search_dir.path());

    let h = harness(approval_settings());
    seed_corpus(
        &h.pool,
        "The uptime target is reviewed by the platform team",
        "SLO notes",
        None,
    );

    let mut rx = h.runtime.ask_stream(borderline_citation_params());
    let mut frames: Vec<(String, serde_json::Value)> = Vec::new();
    let mut approval_id: Option<String> = None;
    while let Some(frame) = rx.recv().await {
        let mut name = String::new();
        let mut data = serde_json::Value::Null;
        for line in frame.lines() {
            if let Some(rest) = line.strip_prefix("event: ") {
                name = rest.to_string();
            } else if let Some(rest) = line.strip_prefix("data: ") {
                data = serde_json::from_str(rest).unwrap_or(serde_json::Value::Null);
            }
        }
        if name == "tool" && data["status"] == "waiting_approval" && approval_id.is_none() {
            let id = data["id"].as_str().unwrap().to_string();
            approval_id = Some(id.clone());
            h.runtime
                .approve(&ApproveRequest {
                    approval_id: id,
                    approved: true,
                    reason: None,
                })
                .unwrap();
        }
        let done = name == "final" || name == "error";
        frames.push((name, data));
        if done {
            break;
        }
    }
    std::env::remove_var("ATTEST_WEB_SEARCH_FIXTURE");
    std::env::remove_var("ATTEST_WEB_FETCH_FIXTURE_DIR");

    assert!(approval_id.is_some(), "no approval requested: {:?}", names(&frames));
    let tool_events: Vec<&serde_json::Value> = frames
        .iter()
        .filter(|(n, _)| n == "tool")
        .map(|(_, d)| d)
        .collect();
    assert!(tool_events
        .iter()
        .any(|t| t["name"] == "WEB_SEARCH" && t["status"] == "waiting_approval"));
    assert!(tool_events
        .iter()
        .any(|t| t["name"] == "WEB_SEARCH" && t["status"] == "start"));
    assert!(tool_events
        .iter()
        .any(|t| t["name"] == "WEB_SEARCH" && t["status"] == "stop"));
    assert_eq!(frames.last().unwrap().0, "final");
    h.runtime.shutdown();
}

#[tokio::test]
async fn s3_approval_denied_abstains_with_issue() {
    let h = harness(approval_settings());
    seed_corpus(
        &h.pool,
        "The uptime target is reviewed by the platform team",
        "SLO notes",
        None,
    );

    let mut rx = h.runtime.ask_stream(borderline_citation_params());
    let mut frames: Vec<(String, serde_json::Value)> = Vec::new();
    while let Some(frame) = rx.recv().await {
        let mut name = String::new();
        let mut data = serde_json::Value::Null;
        for line in frame.lines() {
            if let Some(rest) = line.strip_prefix("event: ") {
                name = rest.to_string();
            } else if let Some(rest) = line.strip_prefix("data: ") {
                data = serde_json::from_str(rest).unwrap_or(serde_json::Value::Null);
            }
        }
        if name == "tool" && data["status"] == "waiting_approval" {
            h.runtime
                .approve(&ApproveRequest {
                    approval_id: data["id"].as_str().unwrap().to_string(),
                    approved: false,
                    reason: Some("not in scope".to_string()),
                })
                .unwrap();
        }
        let done = name == "final" || name == "error";
        frames.push((name, data));
        if done {
            break;
        }
    }

    let result = final_payload(&frames);
    assert_eq!(result["action"], "abstain");
    let issues: Vec<&str> = result["issues"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|i| i["kind"].as_str())
        .collect();
    assert!(issues.contains(&"approval_denied"), "issues: {issues:?}");
    h.runtime.shutdown();
}

#[tokio::test]
async fn s3_approval_ttl_expiry_skips_tool() {
    let h = harness(Settings {
        approvals_ttl_seconds: 1,
        ..approval_settings()
    });
    seed_corpus(
        &h.pool,
        "The uptime target is reviewed by the platform team",
        "SLO notes",
        None,
    );

    // Never resolve the approval; the wait must end at the TTL.
    let frames = collect_frames(h.runtime.ask_stream(borderline_citation_params())).await;
    let result = final_payload(&frames);
    assert_eq!(result["action"], "abstain");
    let issues: Vec<&str> = result["issues"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|i| i["kind"].as_str())
        .collect();
    assert!(issues.contains(&"approval_expired"), "issues: {issues:?}");
    h.runtime.shutdown();
}

// ─────────────────────────────────────────────────────────────────────────────
// S4: PCN resolution with units
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn s4_pcn_verified_value_substituted() {
    let _guard = env_lock();
    let fixture_dir = tempfile::tempdir().unwrap();
    write_fetch_fixture(
        &fixture_dir,
        "metrics.example.com_latency.html",
        "<html>Measured latency stayed at 42 for the whole window.</html>",
    );
    let search_fixture = fixture_dir.path().join("search.json");
    std::fs::write(
        &search_fixture,
        serde_json::json!([{
            "title": "Latency metrics",
            "url": "https://metrics.example.com/latency",
            "snippet": "latency measurements summary"
        }])
        .to_string(),
    )
    .unwrap();
    std::env::set_var("ATTEST_WEB_SEARCH_FIXTURE", &search_fixture);
    std::env::set_var("ATTEST_WEB_FETCH_FIXTURE_DIR", fixture_dir.path());

    let settings = Settings {
        cp_enabled: false,
        ..Default::default()
    };
    let h = harness(settings);
    seed_corpus(
        &h.pool,
        "Latency is measured for every request in the gateway",
        "Latency notes",
        None,
    );

    let mut params =
        AskParams::question("What is the measured latency total? Please cite the source.");
    params.accept_threshold = Some(0.9);
    params.borderline_delta = Some(0.45);
    params.tool_budget_per_refinement = Some(3);
    params.math_units = Some("ms".to_string());
    let frames = collect_frames(h.runtime.ask_stream(params)).await;

    std::env::remove_var("ATTEST_WEB_SEARCH_FIXTURE");
    std::env::remove_var("ATTEST_WEB_FETCH_FIXTURE_DIR");

    let pcn_events: Vec<&serde_json::Value> = frames
        .iter()
        .filter(|(n, _)| n == "pcn")
        .map(|(_, d)| d)
        .collect();
    assert!(pcn_events.iter().any(|p| p["type"] == "pcn_pending"));
    let verified_math = pcn_events
        .iter()
        .find(|p| p["type"] == "pcn_verified" && p["value"] == "42");
    assert!(verified_math.is_some(), "pcn events: {pcn_events:?}");
    assert_eq!(verified_math.unwrap()["policy"]["units"], "ms");

    let result = final_payload(&frames);
    let answer = result["answer"].as_str().unwrap();
    assert!(answer.contains("42 ms"), "answer: {answer}");
    assert!(!answer.contains("[PCN:"), "placeholder leaked: {answer}");
    h.runtime.shutdown();
}

// ─────────────────────────────────────────────────────────────────────────────
// S5: disallowed tool is blocked without budget charge
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn s5_disallowed_tool_blocked() {
    let settings = Settings {
        cp_enabled: false,
        ..Default::default()
    };
    let h = harness(settings);
    {
        let conn = h.pool.get().unwrap();
        workspaces::ensure_workspace(&conn, "locked", None).unwrap();
        workspaces::set_policy_value(
            &conn,
            "locked",
            "tools_allowed",
            &serde_json::json!(["MATH_EVAL"]),
        )
        .unwrap();
    }
    seed_corpus(
        &h.pool,
        "The uptime target is reviewed by the platform team",
        "SLO notes",
        None,
    );

    let mut params = borderline_citation_params();
    params.workspace = "locked".to_string();
    let frames = collect_frames(h.runtime.ask_stream(params)).await;

    let tool_events: Vec<&serde_json::Value> = frames
        .iter()
        .filter(|(n, _)| n == "tool")
        .map(|(_, d)| d)
        .collect();
    assert!(tool_events
        .iter()
        .any(|t| t["name"] == "WEB_SEARCH" && t["status"] == "blocked"));
    assert!(!tool_events.iter().any(|t| t["status"] == "start"));

    let result = final_payload(&frames);
    let tools_used = result["tools_used"].as_array().unwrap();
    assert!(tools_used.is_empty(), "tools_used: {tools_used:?}");
    h.runtime.shutdown();
}

// ─────────────────────────────────────────────────────────────────────────────
// S6: SQL guard rejects statement stacking
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn s6_sql_guard_blocks_stacked_statements() {
    let settings = Settings {
        cp_enabled: false,
        table_allowed: vec!["t".to_string()],
        ..Default::default()
    };
    let h = harness(settings);
    {
        let conn = h.pool.get().unwrap();
        conn.execute_batch("CREATE TABLE t (n INTEGER); INSERT INTO t VALUES (7);")
            .unwrap();
    }
    seed_corpus(
        &h.pool,
        "The reporting table holds the canonical row totals",
        "Reporting",
        None,
    );

    let mut params = AskParams::question("How many rows are in the reporting table count?");
    params.accept_threshold = Some(0.9);
    params.borderline_delta = Some(0.45);
    params.table_query_sql = Some("SELECT * FROM t; DROP TABLE t;".to_string());
    let frames = collect_frames(h.runtime.ask_stream(params)).await;

    let tool_events: Vec<&serde_json::Value> = frames
        .iter()
        .filter(|(n, _)| n == "tool")
        .map(|(_, d)| d)
        .collect();
    assert!(tool_events
        .iter()
        .any(|t| t["name"] == "TABLE_QUERY" && t["status"] == "error"));

    let result = final_payload(&frames);
    let issues: Vec<&str> = result["issues"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|i| i["kind"].as_str())
        .collect();
    assert!(issues.contains(&"sql_violation"), "issues: {issues:?}");

    // No write happened.
    let conn = h.pool.get().unwrap();
    let rows: i64 = conn.query_row("SELECT count(*) FROM t", [], |r| r.get(0)).unwrap();
    assert_eq!(rows, 1);
    h.runtime.shutdown();
}

// ─────────────────────────────────────────────────────────────────────────────
// Cross-cutting invariants
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn empty_pack_abstains_with_missing_evidence() {
    let h = harness(Settings::default());
    let frames = collect_frames(
        h.runtime
            .ask_stream(AskParams::question("What is the forecast for tomorrow?")),
    )
    .await;
    let result = final_payload(&frames);
    assert_eq!(result["action"], "abstain");
    let issues: Vec<&str> = result["issues"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|i| i["kind"].as_str())
        .collect();
    assert!(issues.contains(&"missing_evidence"));
    assert!(result["pack_ids"].as_array().unwrap().is_empty());
    h.runtime.shutdown();
}

#[tokio::test]
async fn zero_refinements_never_iterates() {
    let h = harness(Settings {
        cp_enabled: false,
        ..Default::default()
    });
    seed_corpus(
        &h.pool,
        "The uptime target is reviewed by the platform team",
        "SLO notes",
        None,
    );
    let mut params = borderline_citation_params();
    params.max_refinements = Some(0);
    let frames = collect_frames(h.runtime.ask_stream(params)).await;
    let result = final_payload(&frames);
    assert_ne!(result["action"], "iterate");
    assert_eq!(
        names(&frames).iter().filter(|n| **n == "score").count(),
        1,
        "no refinement scores expected"
    );
    h.runtime.shutdown();
}

#[tokio::test]
async fn persisted_steps_are_redacted() {
    let h = harness(Settings::default());
    seed_corpus(&h.pool, "Support contact routing and escalation", "Contacts", None);
    let params = AskParams::question(
        "Should I email bob@example.com or call +1 (555) 010-9999 about escalation contact routing?",
    );
    let frames = collect_frames(h.runtime.ask_stream(params)).await;
    assert!(names(&frames).contains(&"final"));

    let records = h
        .runtime
        .recent_steps(&StepFilter {
            limit: 10,
            include_trace: true,
            ..Default::default()
        })
        .unwrap();
    assert!(!records.is_empty());
    for record in records {
        assert!(!record.question.contains("bob@example.com"));
        assert!(!record.question.contains("555"));
        assert!(record.question.contains("[REDACTED_EMAIL]"));
    }
    h.runtime.shutdown();
}

#[tokio::test]
async fn tool_budgets_bound_invocations() {
    let _guard = env_lock();
    let search_dir = tempfile::tempdir().unwrap();
    let search_fixture = search_dir.path().join("search.json");
    std::fs::write(
        &search_fixture,
        serde_json::json!([{"title": "t", "url": "https://docs.example.com/a", "snippet": "uptime"}])
            .to_string(),
    )
    .unwrap();
    std::env::set_var("ATTEST_WEB_SEARCH_FIXTURE", &search_fixture);

    let h = harness(Settings {
        cp_enabled: false,
        ..Default::default()
    });
    seed_corpus(
        &h.pool,
        "The uptime target is reviewed by the platform team",
        "SLO notes",
        None,
    );
    let mut params = borderline_citation_params();
    params.tool_budget_per_refinement = Some(1);
    params.tool_budget_per_turn = Some(1);
    let frames = collect_frames(h.runtime.ask_stream(params)).await;
    std::env::remove_var("ATTEST_WEB_SEARCH_FIXTURE");

    let starts = frames
        .iter()
        .filter(|(n, d)| n == "tool" && d["status"] == "start")
        .count();
    assert!(starts <= 1, "budget exceeded: {starts} starts");
    let result = final_payload(&frames);
    assert!(result["usage"]["tool_calls"].as_u64().unwrap() <= 1);
    h.runtime.shutdown();
}

#[tokio::test]
async fn latency_budget_forces_abstain_before_tools() {
    let h = harness(Settings {
        cp_enabled: false,
        ..Default::default()
    });
    seed_corpus(
        &h.pool,
        "The uptime target is reviewed by the platform team",
        "SLO notes",
        None,
    );
    let mut params = borderline_citation_params();
    params.latency_budget_ms = Some(1);
    // Give the initial pass a moment to overrun the budget.
    let frames = collect_frames(h.runtime.ask_stream(params)).await;
    let result = final_payload(&frames);
    assert_eq!(result["action"], "abstain");
    assert!(!names(&frames).iter().any(|n| *n == "tool"));
    h.runtime.shutdown();
}

#[tokio::test]
async fn idempotency_key_replays_identical_answer() {
    let h = harness(Settings {
        cp_enabled: false,
        accept_threshold: 0.7,
        ..Default::default()
    });
    seed_corpus(
        &h.pool,
        "X is Y.",
        "Definition",
        Some("https://docs.example.com/x"),
    );
    let mut params = AskParams::question("What is X?");
    params.idempotency_key = Some("idem-1".to_string());
    params.max_refinements = Some(0);

    let first = h.runtime.ask(params.clone()).await.unwrap();
    let second = h.runtime.ask(params).await.unwrap();
    let (AskOutcome::Completed { result: a }, AskOutcome::Completed { result: b }) =
        (first, second)
    else {
        panic!("expected completed outcomes");
    };
    assert_eq!(a.answer, b.answer);
    assert_eq!(a.request_id, b.request_id);
    h.runtime.shutdown();
}

#[tokio::test]
async fn memory_items_ground_answers() {
    let h = harness(Settings {
        cp_enabled: false,
        accept_threshold: 0.7,
        ..Default::default()
    });
    {
        let conn = h.pool.get().unwrap();
        memory::add_memory(
            &conn,
            "slo",
            "The uptime target is 99.9 percent for the api service.",
            "default",
            None,
            None,
        )
        .unwrap();
    }
    let mut params = AskParams::question("What is the uptime target for the api service?");
    params.max_refinements = Some(0);
    let frames = collect_frames(h.runtime.ask_stream(params)).await;
    let result = final_payload(&frames);
    assert!(result["answer"].as_str().unwrap().contains("99.9"));
    assert!(!result["pack_ids"].as_array().unwrap().is_empty());
    h.runtime.shutdown();
}

#[tokio::test]
async fn stream_replays_ready_and_final_only() {
    let h = harness(Settings {
        cp_enabled: false,
        accept_threshold: 0.7,
        ..Default::default()
    });
    seed_corpus(&h.pool, "X is Y.", "Definition", None);
    let mut params = AskParams::question("What is X?");
    params.idempotency_key = Some("replay-1".to_string());
    params.max_refinements = Some(0);

    let first = collect_frames(h.runtime.ask_stream(params.clone())).await;
    assert!(names(&first).len() > 2);
    // The cache write lands just after the final frame is delivered.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let replay = collect_frames(h.runtime.ask_stream(params)).await;
    assert_eq!(names(&replay), vec!["ready", "final"]);
    assert_eq!(
        final_payload(&first)["answer"],
        final_payload(&replay)["answer"]
    );
    h.runtime.shutdown();
}

#[tokio::test]
async fn heartbeat_keeps_stream_alive_while_waiting() {
    let h = harness(Settings {
        cp_enabled: false,
        heartbeat_seconds: 1,
        tools_requiring_approval: vec!["WEB_SEARCH".to_string()],
        ..Default::default()
    });
    seed_corpus(
        &h.pool,
        "The uptime target is reviewed by the platform team",
        "SLO notes",
        None,
    );
    let mut rx = h.runtime.ask_stream(borderline_citation_params());

    // Read until waiting_approval, then expect a heartbeat while pending.
    let mut saw_waiting = false;
    let mut saw_heartbeat = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        let Ok(Some(frame)) =
            tokio::time::timeout(Duration::from_secs(5), rx.recv()).await
        else {
            break;
        };
        if frame.contains("waiting_approval") {
            saw_waiting = true;
        }
        if saw_waiting && frame.starts_with("event: heartbeat") {
            saw_heartbeat = true;
            break;
        }
    }
    assert!(saw_waiting);
    assert!(saw_heartbeat);
    h.runtime.shutdown();
}

#[tokio::test]
async fn cp_threshold_endpoint_reports_cached_state() {
    let h = harness(Settings::default());
    let first = h.runtime.cp_threshold("fresh-domain").unwrap();
    assert!(!first.cached);
    let second = h.runtime.cp_threshold("fresh-domain").unwrap();
    assert!(second.cached);
    assert_eq!(first.tau, second.tau);
    h.runtime.shutdown();
}

#[tokio::test]
async fn recent_steps_and_detail_roundtrip() {
    let h = harness(Settings {
        cp_enabled: false,
        accept_threshold: 0.7,
        ..Default::default()
    });
    seed_corpus(&h.pool, "X is Y.", "Definition", None);
    let mut params = AskParams::question("What is X?");
    params.max_refinements = Some(0);
    collect_frames(h.runtime.ask_stream(params)).await;

    let records = h
        .runtime
        .recent_steps(&StepFilter {
            limit: 5,
            ..Default::default()
        })
        .unwrap();
    assert!(!records.is_empty());
    let detail = h.runtime.step_detail(&records[0].id).unwrap().unwrap();
    assert_eq!(detail.id, records[0].id);
    h.runtime.shutdown();
}

#[tokio::test]
async fn metrics_track_requests_and_render() {
    let h = harness(Settings {
        cp_enabled: false,
        accept_threshold: 0.7,
        ..Default::default()
    });
    seed_corpus(&h.pool, "X is Y.", "Definition", None);
    let mut params = AskParams::question("What is X?");
    params.max_refinements = Some(0);
    collect_frames(h.runtime.ask_stream(params)).await;

    let prom = h.runtime.metrics_prometheus();
    assert!(prom.contains("attest_requests_total 1"));
    let json = h.runtime.metrics_json();
    assert_eq!(json.requests, 1);
    assert_eq!(json.answers, 1);
    h.runtime.shutdown();
}

#[tokio::test]
async fn overlay_rejects_unknown_keys_per_request() {
    let h = harness(Settings::default());
    {
        let conn = h.pool.get().unwrap();
        workspaces::ensure_workspace(&conn, "bad", None).unwrap();
        // Bypass the validated setter shape by writing a key the closed
        // set does not admit; the request must then fail validation.
        workspaces::set_policy_value(&conn, "bad", "surprise_knob", &serde_json::json!(1)).unwrap();
    }
    let mut params = AskParams::question("What is X?");
    params.workspace = "bad".to_string();
    let frames = collect_frames(h.runtime.ask_stream(params)).await;
    let ns = names(&frames);
    assert_eq!(ns.last(), Some(&"error"));
    assert_eq!(ns.iter().filter(|n| **n == "final").count(), 0);
    h.runtime.shutdown();
}

#[tokio::test]
async fn events_always_have_single_terminal() {
    let h = harness(Settings::default());
    for question in ["What is X?", "", "How many rows in the demo table count?"] {
        let frames = collect_frames(
            h.runtime.ask_stream(AskParams::question(question.to_string())),
        )
        .await;
        let terminals = names(&frames)
            .iter()
            .filter(|n| **n == "final" || **n == "error")
            .count();
        assert_eq!(terminals, 1, "question {question:?}: {:?}", names(&frames));
        assert_eq!(names(&frames).first(), Some(&"ready"));
    }
    h.runtime.shutdown();
}
