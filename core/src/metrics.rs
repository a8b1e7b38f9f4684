//! In-process metrics
//!
//! Counters use atomic adds; histogram observations are lock-free per
//! bucket. Rendered in Prometheus text form and as JSON with alert
//! flags derived from current settings.

use std::sync::atomic::{AtomicU64, Ordering};

use std::collections::BTreeMap;

use serde::Serialize;

use crate::approvals::ApprovalsSnapshot;
use crate::config::Settings;
use crate::policy::drift::FalseAcceptAlert;

const LATENCY_BUCKETS_MS: &[u64] = &[10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10_000, 30_000];

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket latency histogram.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: LATENCY_BUCKETS_MS.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }
}

impl Histogram {
    pub fn observe_ms(&self, value: u64) {
        for (i, bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
            if value <= *bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_ms.fetch_add(value, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Approximate quantile from bucket bounds.
    pub fn quantile_ms(&self, q: f64) -> Option<u64> {
        let total = self.count();
        if total == 0 {
            return None;
        }
        let target = (q.clamp(0.0, 1.0) * total as f64).ceil() as u64;
        for (i, bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
            if self.buckets[i].load(Ordering::Relaxed) >= target {
                return Some(*bound);
            }
        }
        LATENCY_BUCKETS_MS.last().copied()
    }
}

/// Process-wide metrics registry.
#[derive(Debug, Default)]
pub struct Metrics {
    pub requests: Counter,
    pub answers: Counter,
    pub accept: Counter,
    pub iterate: Counter,
    pub abstain: Counter,
    pub errors: Counter,
    pub tool_start: Counter,
    pub tool_blocked: Counter,
    pub tool_error: Counter,
    pub gov_failures: Counter,
    pub idempotent_replays: Counter,
    pub answer_latency: Histogram,
}

#[derive(Debug, Serialize)]
pub struct AlertFlags {
    pub abstain_rate_high: bool,
    pub latency_p95_high: bool,
    pub approvals_pending_high: bool,
}

#[derive(Debug, Serialize)]
pub struct MetricsJson {
    pub requests: u64,
    pub answers: u64,
    pub accept: u64,
    pub iterate: u64,
    pub abstain: u64,
    pub errors: u64,
    pub tool_start: u64,
    pub tool_blocked: u64,
    pub tool_error: u64,
    pub gov_failures: u64,
    pub idempotent_replays: u64,
    pub answer_latency_count: u64,
    pub answer_latency_p50_ms: Option<u64>,
    pub answer_latency_p95_ms: Option<u64>,
    pub approvals: ApprovalsSnapshot,
    pub alerts: AlertFlags,
    /// Domains whose rolling false-accept rate exceeds the calibration
    /// target plus tolerance.
    pub calibration_alerts: BTreeMap<String, FalseAcceptAlert>,
}

impl Metrics {
    pub fn record_action(&self, action: attest_protocol::Action) {
        self.answers.inc();
        match action {
            attest_protocol::Action::Accept => self.accept.inc(),
            attest_protocol::Action::Iterate => self.iterate.inc(),
            attest_protocol::Action::Abstain => self.abstain.inc(),
        }
    }

    /// Prometheus text exposition.
    pub fn render_prometheus(&self, approvals: &ApprovalsSnapshot) -> String {
        let mut out = String::new();
        let mut counter = |name: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
            ));
        };
        counter("attest_requests_total", "Requests received", self.requests.get());
        counter("attest_answers_total", "Answers produced", self.answers.get());
        counter("attest_accept_total", "Accept decisions", self.accept.get());
        counter("attest_iterate_total", "Iterate decisions", self.iterate.get());
        counter("attest_abstain_total", "Abstain decisions", self.abstain.get());
        counter("attest_errors_total", "Terminal errors", self.errors.get());
        counter("attest_tool_start_total", "Tool executions", self.tool_start.get());
        counter("attest_tool_blocked_total", "Tools blocked by policy", self.tool_blocked.get());
        counter("attest_tool_error_total", "Tool failures", self.tool_error.get());
        counter("attest_gov_failures_total", "GoV failures", self.gov_failures.get());

        out.push_str("# HELP attest_approvals_pending Pending approvals\n");
        out.push_str("# TYPE attest_approvals_pending gauge\n");
        out.push_str(&format!("attest_approvals_pending {}\n", approvals.pending));

        out.push_str("# HELP attest_answer_latency_ms Answer latency\n");
        out.push_str("# TYPE attest_answer_latency_ms histogram\n");
        for (i, bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
            let cumulative = self.answer_latency.buckets[i].load(Ordering::Relaxed);
            out.push_str(&format!(
                "attest_answer_latency_ms_bucket{{le=\"{bound}\"}} {cumulative}\n"
            ));
        }
        out.push_str(&format!(
            "attest_answer_latency_ms_bucket{{le=\"+Inf\"}} {}\n",
            self.answer_latency.count()
        ));
        out.push_str(&format!(
            "attest_answer_latency_ms_sum {}\n",
            self.answer_latency.sum_ms.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "attest_answer_latency_ms_count {}\n",
            self.answer_latency.count()
        ));
        out
    }

    /// JSON form with alert flags.
    pub fn render_json(
        &self,
        settings: &Settings,
        approvals: &ApprovalsSnapshot,
        calibration_alerts: BTreeMap<String, FalseAcceptAlert>,
    ) -> MetricsJson {
        let answers = self.answers.get();
        let abstain = self.abstain.get();
        let abstain_rate_high = answers >= 20 && abstain as f64 / answers as f64 > 0.3;
        let p95 = self.answer_latency.quantile_ms(0.95);
        let latency_p95_high = self.answer_latency.count() >= 20
            && p95.map_or(false, |v| v as f64 > settings.latency_budget_ms as f64 * 0.5);
        MetricsJson {
            requests: self.requests.get(),
            answers,
            accept: self.accept.get(),
            iterate: self.iterate.get(),
            abstain,
            errors: self.errors.get(),
            tool_start: self.tool_start.get(),
            tool_blocked: self.tool_blocked.get(),
            tool_error: self.tool_error.get(),
            gov_failures: self.gov_failures.get(),
            idempotent_replays: self.idempotent_replays.get(),
            answer_latency_count: self.answer_latency.count(),
            answer_latency_p50_ms: self.answer_latency.quantile_ms(0.5),
            answer_latency_p95_ms: p95,
            approvals: approvals.clone(),
            alerts: AlertFlags {
                abstain_rate_high,
                latency_p95_high,
                approvals_pending_high: approvals.pending > 5,
            },
            calibration_alerts,
        }
    }
}
