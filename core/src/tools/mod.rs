//! Built-in tool dispatch
//!
//! Each tool has a stable contract and returns explicit outcome values
//! instead of using errors for control flow. The orchestrator charges
//! budgets only for calls that actually execute; blocked calls cost
//! nothing.

pub mod math_eval;
pub mod table_query;
pub mod web_fetch;
pub mod web_search;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use attest_protocol::ToolMeta;

/// Machine-readable tool failure kinds, matching the wire codes surfaced
/// in tool events and issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorKind {
    NetworkError,
    PolicyBlocked,
    TlsRequired,
    PrivateIpBlocked,
    TooLarge,
    RedirectLimit,
    InjectionBlocked,
    ParseError,
    DomainError,
    UnitMismatch,
    NotSelect,
    ForbiddenConstruct,
    TableNotAllowed,
    RateLimited,
    RowLimitExceeded,
    Timeout,
    Internal,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkError => "network_error",
            Self::PolicyBlocked => "policy_blocked",
            Self::TlsRequired => "tls_required",
            Self::PrivateIpBlocked => "private_ip_blocked",
            Self::TooLarge => "too_large",
            Self::RedirectLimit => "redirect_limit",
            Self::InjectionBlocked => "injection_blocked",
            Self::ParseError => "parse_error",
            Self::DomainError => "domain_error",
            Self::UnitMismatch => "unit_mismatch",
            Self::NotSelect => "not_select",
            Self::ForbiddenConstruct => "forbidden_construct",
            Self::TableNotAllowed => "table_not_allowed",
            Self::RateLimited => "rate_limited",
            Self::RowLimitExceeded => "row_limit_exceeded",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }
}

/// A tool failure with kind and short detail.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}: {detail}", kind.as_str())]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub detail: String,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Result of attempting one tool invocation.
#[derive(Debug, Clone)]
pub enum ToolOutcome<T> {
    /// Executed; budget was charged.
    Ok { value: T, meta: ToolMeta },
    /// Refused by policy; no budget charge.
    Blocked { reason: String },
    /// Executed and failed; recorded as an issue, iteration continues.
    Failed { kind: ToolErrorKind, detail: String },
    /// Suspended on a pending approval.
    WaitingApproval { id: String },
}

impl<T> ToolOutcome<T> {
    pub fn from_result(result: Result<(T, ToolMeta), ToolError>) -> Self {
        match result {
            Ok((value, meta)) => Self::Ok { value, meta },
            Err(e) => Self::Failed {
                kind: e.kind,
                detail: e.detail,
            },
        }
    }

    pub fn executed(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-table rate limiting
// ─────────────────────────────────────────────────────────────────────────────

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_minute: u32) -> Self {
        let capacity = f64::from(per_minute.max(1));
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token-bucket rate limiter keyed by table name, monotonic clock.
#[derive(Default)]
pub struct TableRateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl TableRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire one permit for `table` at `per_minute` capacity.
    pub fn try_acquire(&self, table: &str, per_minute: u32) -> bool {
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        buckets
            .entry(table.to_lowercase())
            .or_insert_with(|| TokenBucket::new(per_minute))
            .try_acquire()
    }
}
