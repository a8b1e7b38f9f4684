//! Proof-carrying numbers
//!
//! Every numeric fact produced by a tool is minted as a PCN entry in a
//! per-request ledger. The draft only ever holds placeholder tokens
//! (`[PCN:<id>]`); before final emission each placeholder resolves to the
//! verified value or the `[unverified]` sentinel. The ledger is the
//! request-scoped arena the draft and GoV edges reference by id.

pub mod checks;
pub mod units;

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex_lite::Regex;

use attest_protocol::{PcnEventKind, PcnPayload, PcnPolicy, Provenance};

use crate::tools::math_eval;

/// Sentinel substituted for placeholders that never verified.
pub const UNVERIFIED_SENTINEL: &str = "[unverified]";

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[PCN:[^\]]+\]").expect("pcn placeholder pattern"));

/// Verification state of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcnStatus {
    Pending,
    Verified,
    Failed,
}

#[derive(Debug, Clone)]
pub struct PcnEntry {
    pub id: String,
    pub policy: PcnPolicy,
    pub provenance: Provenance,
    pub status: PcnStatus,
    pub value: Option<String>,
    pub reason: Option<String>,
}

impl PcnEntry {
    fn payload(&self, kind: PcnEventKind) -> PcnPayload {
        PcnPayload {
            id: self.id.clone(),
            kind,
            value: self.value.clone(),
            reason: self.reason.clone(),
            policy: self.policy.clone(),
            provenance: self.provenance.clone(),
        }
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value:.6}")
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    }
}

/// Per-request arena of PCN entries.
#[derive(Debug, Default)]
pub struct PcnLedger {
    entries: HashMap<String, PcnEntry>,
}

impl PcnLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a new entry; returns the pending event payload.
    pub fn register(&mut self, id: &str, policy: PcnPolicy, provenance: Provenance) -> PcnPayload {
        let entry = PcnEntry {
            id: id.to_string(),
            policy,
            provenance,
            status: PcnStatus::Pending,
            value: None,
            reason: None,
        };
        let payload = entry.payload(PcnEventKind::PcnPending);
        self.entries.insert(id.to_string(), entry);
        payload
    }

    /// Placeholder token for an entry.
    pub fn placeholder(id: &str) -> String {
        format!("[PCN:{id}]")
    }

    fn verify_numeric(&mut self, id: &str, value: f64, expected: Option<f64>) -> PcnPayload {
        let Some(entry) = self.entries.get_mut(id) else {
            // Unknown id: mint a failed entry so the event stream stays
            // consistent.
            let entry = PcnEntry {
                id: id.to_string(),
                policy: PcnPolicy::default(),
                provenance: Provenance::Math {
                    expr: String::new(),
                },
                status: PcnStatus::Failed,
                value: None,
                reason: Some("unknown pcn id".to_string()),
            };
            let payload = entry.payload(PcnEventKind::PcnFailed);
            self.entries.insert(id.to_string(), entry);
            return payload;
        };

        let mut failure: Option<String> = None;
        if let Some(expected) = expected {
            let tolerance = entry.policy.tolerance.unwrap_or(0.0).max(0.0);
            if (expected - value).abs() > tolerance {
                failure = Some(format!(
                    "value {value} differs from expected {expected} (tol={tolerance})"
                ));
            }
        }
        if failure.is_none() {
            if let Some(units) = &entry.policy.units {
                if !units::validate_numeric_unit(value, units) {
                    failure = Some(format!("invalid_units:{units}"));
                }
            }
        }
        if failure.is_none() {
            if let Some(min) = entry.policy.min {
                if value < min {
                    failure = Some(format!("below_min:{min}"));
                }
            }
        }
        if failure.is_none() {
            if let Some(max) = entry.policy.max {
                if value > max {
                    failure = Some(format!("above_max:{max}"));
                }
            }
        }

        match failure {
            Some(reason) => {
                entry.status = PcnStatus::Failed;
                entry.reason = Some(reason);
                entry.payload(PcnEventKind::PcnFailed)
            }
            None => {
                entry.status = PcnStatus::Verified;
                entry.value = Some(format_number(value));
                entry.payload(PcnEventKind::PcnVerified)
            }
        }
    }

    /// Verify a math-derived value by recomputing the expression.
    pub fn verify_math(&mut self, id: &str, expr: &str, observed: f64) -> PcnPayload {
        match math_eval::evaluate(expr) {
            Ok(expected) => self.verify_numeric(id, observed, Some(expected)),
            Err(e) => {
                if let Some(entry) = self.entries.get_mut(id) {
                    entry.status = PcnStatus::Failed;
                    entry.reason = Some(format!("recompute failed: {e}"));
                    entry.payload(PcnEventKind::PcnFailed)
                } else {
                    self.verify_numeric(id, observed, Some(f64::NAN))
                }
            }
        }
    }

    /// Verify a SQL-derived numeric value against the entry policy.
    pub fn verify_sql(&mut self, id: &str, value: f64) -> PcnPayload {
        self.verify_numeric(id, value, None)
    }

    /// Mark a URL-provenance entry verified.
    pub fn verify_url(&mut self, id: &str, url: &str) -> PcnPayload {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.status = PcnStatus::Verified;
            entry.value = Some(url.to_string());
            entry.payload(PcnEventKind::PcnVerified)
        } else {
            self.verify_numeric(id, f64::NAN, Some(0.0))
        }
    }

    /// Mark an entry failed.
    pub fn fail(&mut self, id: &str, reason: &str) -> Option<PcnPayload> {
        let entry = self.entries.get_mut(id)?;
        entry.status = PcnStatus::Failed;
        entry.reason = Some(reason.to_string());
        Some(entry.payload(PcnEventKind::PcnFailed))
    }

    pub fn status_of(&self, id: &str) -> Option<PcnStatus> {
        self.entries.get(id).map(|e| e.status)
    }

    /// Verified value for an entry, if any.
    pub fn value_of(&self, id: &str) -> Option<&str> {
        let entry = self.entries.get(id)?;
        if entry.status == PcnStatus::Verified {
            entry.value.as_deref()
        } else {
            None
        }
    }

    /// Entry ids with unresolved (pending or failed) status.
    pub fn unresolved_ids(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.status != PcnStatus::Verified)
            .map(|e| e.id.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace every placeholder in `text` with its verified value or the
    /// unverified sentinel. The raw placeholder never survives.
    pub fn resolve_placeholders(&self, text: &str) -> String {
        PLACEHOLDER_RE
            .replace_all(text, |caps: &regex_lite::Captures<'_>| {
                let token = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
                let id = token
                    .strip_prefix("[PCN:")
                    .and_then(|s| s.strip_suffix(']'))
                    .unwrap_or_default();
                self.value_of(id)
                    .map(str::to_string)
                    .unwrap_or_else(|| UNVERIFIED_SENTINEL.to_string())
            })
            .into_owned()
    }

    /// True when `text` still carries a raw placeholder.
    pub fn has_placeholder(text: &str) -> bool {
        PLACEHOLDER_RE.is_match(text)
    }

    /// Pending placeholders referenced by the draft text.
    pub fn pending_in(&self, text: &str) -> Vec<String> {
        PLACEHOLDER_RE
            .find_iter(text)
            .filter_map(|m| {
                let id = m
                    .as_str()
                    .strip_prefix("[PCN:")
                    .and_then(|s| s.strip_suffix(']'))?;
                match self.status_of(id) {
                    Some(PcnStatus::Verified) => None,
                    _ => Some(id.to_string()),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn math_policy(tolerance: f64) -> PcnPolicy {
        PcnPolicy {
            tolerance: Some(tolerance),
            ..Default::default()
        }
    }

    fn math_prov(expr: &str) -> Provenance {
        Provenance::Math {
            expr: expr.to_string(),
        }
    }

    #[test]
    fn test_register_emits_pending() {
        let mut ledger = PcnLedger::new();
        let event = ledger.register("p1", math_policy(0.0), math_prov("1+1"));
        assert_eq!(event.kind, PcnEventKind::PcnPending);
        assert_eq!(ledger.status_of("p1"), Some(PcnStatus::Pending));
    }

    #[test]
    fn test_verify_math_matches_expression() {
        let mut ledger = PcnLedger::new();
        ledger.register("p1", math_policy(0.0), math_prov("40+2"));
        let event = ledger.verify_math("p1", "40+2", 42.0);
        assert_eq!(event.kind, PcnEventKind::PcnVerified);
        assert_eq!(event.value.as_deref(), Some("42"));
        assert_eq!(ledger.value_of("p1"), Some("42"));
    }

    #[test]
    fn test_verify_math_rejects_mismatch() {
        let mut ledger = PcnLedger::new();
        ledger.register("p1", math_policy(0.0), math_prov("40+2"));
        let event = ledger.verify_math("p1", "40+2", 43.0);
        assert_eq!(event.kind, PcnEventKind::PcnFailed);
        assert_eq!(ledger.value_of("p1"), None);
    }

    #[test]
    fn test_unit_policy_enforced() {
        let mut ledger = PcnLedger::new();
        let policy = PcnPolicy {
            units: Some("parsec".to_string()),
            ..Default::default()
        };
        ledger.register("p1", policy, math_prov("42"));
        let event = ledger.verify_sql("p1", 42.0);
        assert_eq!(event.kind, PcnEventKind::PcnFailed);
        assert!(event.reason.unwrap().contains("invalid_units"));
    }

    #[test]
    fn test_bounds_enforced() {
        let mut ledger = PcnLedger::new();
        let policy = PcnPolicy {
            min: Some(0.0),
            max: Some(100.0),
            ..Default::default()
        };
        ledger.register("p1", policy, math_prov("x"));
        let event = ledger.verify_sql("p1", 150.0);
        assert_eq!(event.kind, PcnEventKind::PcnFailed);
    }

    #[test]
    fn test_resolve_placeholders_substitutes_or_sentinels() {
        let mut ledger = PcnLedger::new();
        ledger.register("ok", math_policy(0.0), math_prov("2*3"));
        ledger.verify_math("ok", "2*3", 6.0);
        ledger.register("bad", math_policy(0.0), math_prov("2*3"));
        ledger.verify_math("bad", "2*3", 7.0);

        let text = format!(
            "total {} vs {} done",
            PcnLedger::placeholder("ok"),
            PcnLedger::placeholder("bad")
        );
        let resolved = ledger.resolve_placeholders(&text);
        assert_eq!(resolved, "total 6 vs [unverified] done");
        assert!(!PcnLedger::has_placeholder(&resolved));
    }

    #[test]
    fn test_pending_in_reports_unverified_tokens() {
        let mut ledger = PcnLedger::new();
        ledger.register("p1", math_policy(0.0), math_prov("1"));
        let text = PcnLedger::placeholder("p1");
        assert_eq!(ledger.pending_in(&text), vec!["p1"]);
        ledger.verify_math("p1", "1", 1.0);
        assert!(ledger.pending_in(&text).is_empty());
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(format_number(42.0), "42");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(1.0 / 3.0), "0.333333");
    }
}
