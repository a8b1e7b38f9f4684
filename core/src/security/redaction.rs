//! PII redaction applied before any text is persisted
//!
//! Raw question/answer text never leaves the process; the audit log only
//! sees the redacted form. SSN masking runs before the phone pattern so
//! the broader phone regex cannot capture an SSN first.

use once_cell::sync::Lazy;
use regex_lite::Regex;

static SSN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn pattern"));
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").expect("email pattern")
});
static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\+?\d[\d \t\-()]{7,}\d").expect("phone pattern"));

pub const SSN_MASK: &str = "[REDACTED_SSN]";
pub const EMAIL_MASK: &str = "[REDACTED_EMAIL]";
pub const PHONE_MASK: &str = "[REDACTED_PHONE]";

/// Redact common personal identifiers. Returns the redacted text and
/// whether anything was masked.
pub fn redact(text: &str) -> (String, bool) {
    if text.is_empty() {
        return (String::new(), false);
    }
    let pass1 = SSN_RE.replace_all(text, SSN_MASK);
    let pass2 = EMAIL_RE.replace_all(&pass1, EMAIL_MASK);
    let pass3 = PHONE_RE.replace_all(&pass2, PHONE_MASK);
    let changed = pass3 != text;
    (pass3.into_owned(), changed)
}
