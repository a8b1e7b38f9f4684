//! Verifier issue vocabulary
//!
//! Issues are a closed set so the refinement loop can route tools by kind
//! instead of string-matching free text. `detail` carries optional context
//! (a column name, a blocked pattern) and never raw user text.

use serde::{Deserialize, Serialize};

/// Closed set of verifier/orchestrator issue kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MissingCitations,
    MissingNumbers,
    MissingTableData,
    MissingEvidence,
    NumericUnverified,
    Governance,
    UnsupportedClaim,
    InjectionSuspected,
    UnitMismatch,
    SqlViolation,
    CpMissingCalibration,
    ApprovalDenied,
    ApprovalExpired,
    PolicyViolation,
    VerifierDegenerate,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingCitations => "missing_citations",
            Self::MissingNumbers => "missing_numbers",
            Self::MissingTableData => "missing_table_data",
            Self::MissingEvidence => "missing_evidence",
            Self::NumericUnverified => "numeric_unverified",
            Self::Governance => "governance",
            Self::UnsupportedClaim => "unsupported_claim",
            Self::InjectionSuspected => "injection_suspected",
            Self::UnitMismatch => "unit_mismatch",
            Self::SqlViolation => "sql_violation",
            Self::CpMissingCalibration => "cp_missing_calibration",
            Self::ApprovalDenied => "approval_denied",
            Self::ApprovalExpired => "approval_expired",
            Self::PolicyViolation => "policy_violation",
            Self::VerifierDegenerate => "verifier_degenerate",
        }
    }

    /// Whether a refinement pass can plausibly clear this issue with tools.
    ///
    /// Borderline decisions only iterate when at least one issue is fixable;
    /// anything else abstains immediately.
    pub fn fixable(&self) -> bool {
        matches!(
            self,
            Self::MissingCitations
                | Self::MissingNumbers
                | Self::MissingTableData
                | Self::MissingEvidence
                | Self::NumericUnverified
                | Self::Governance
        )
    }
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single verifier finding: kind plus optional short detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Issue {
    pub fn new(kind: IssueKind) -> Self {
        Self { kind, detail: None }
    }

    pub fn with_detail(kind: IssueKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: Some(detail.into()),
        }
    }
}

impl From<IssueKind> for Issue {
    fn from(kind: IssueKind) -> Self {
        Self::new(kind)
    }
}

/// Render issue kinds as the string list used in trace events.
pub fn kinds(issues: &[Issue]) -> Vec<String> {
    issues.iter().map(|i| i.kind.as_str().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_kind_serializes_snake_case() {
        let json = serde_json::to_string(&IssueKind::MissingCitations).unwrap();
        assert_eq!(json, "\"missing_citations\"");
        let back: IssueKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, IssueKind::MissingCitations);
    }

    #[test]
    fn test_fixable_partition() {
        assert!(IssueKind::MissingEvidence.fixable());
        assert!(IssueKind::NumericUnverified.fixable());
        assert!(IssueKind::Governance.fixable());
        assert!(!IssueKind::ApprovalDenied.fixable());
        assert!(!IssueKind::VerifierDegenerate.fixable());
    }

    #[test]
    fn test_issue_detail_omitted_when_none() {
        let issue = Issue::new(IssueKind::SqlViolation);
        let json = serde_json::to_value(&issue).unwrap();
        assert!(json.get("detail").is_none());
    }
}
