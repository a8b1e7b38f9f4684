//! Prompt-injection detection over tool output
//!
//! Fetched content is untrusted. Any instruction-shaped text inside it is
//! grounds for rejecting the payload; short fragments destined for prompts
//! are replaced with a filtered marker instead.

use once_cell::sync::Lazy;
use regex_lite::Regex;

/// A single suspicious match within tool output.
#[derive(Debug, Clone, PartialEq)]
pub struct InjectionFinding {
    pub pattern: String,
    pub excerpt: String,
}

static INJECTION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)ignore\s+(all|any|previous|prior|earlier)\s+(instruction|instructions|command|commands)",
        r"(?i)forget\s+(all|any|previous|prior|earlier)\s+instructions?",
        r"(?i)system\s+prompt",
        r"(?i)(override|bypass).{0,15}instruction",
        r"(?i)(begin|end)\s+prompt",
        r"(?i)run\s+shell",
        r"(?i)sudo\s",
        r"(?i)rm\s+-rf",
        r"(?i)bypass\s+safety",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("injection pattern"))
    .collect()
});

fn excerpt_around(text: &str, start: usize, end: usize) -> String {
    const RADIUS: usize = 40;
    let mut from = start.saturating_sub(RADIUS);
    while from > 0 && !text.is_char_boundary(from) {
        from -= 1;
    }
    let mut to = (end + RADIUS).min(text.len());
    while to < text.len() && !text.is_char_boundary(to) {
        to += 1;
    }
    text[from..to].split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Scan text for instruction-shaped content.
pub fn detect_injection(text: &str) -> Vec<InjectionFinding> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut findings = Vec::new();
    let mut seen_spans: Vec<(usize, usize)> = Vec::new();
    for pattern in INJECTION_PATTERNS.iter() {
        if let Some(m) = pattern.find(text) {
            let span = (m.start(), m.end());
            if seen_spans.contains(&span) {
                continue;
            }
            seen_spans.push(span);
            findings.push(InjectionFinding {
                pattern: pattern.as_str().to_string(),
                excerpt: excerpt_around(text, m.start(), m.end()),
            });
        }
    }
    findings
}

/// True when the text is safe to hand to downstream composition.
pub fn is_safe_tool_text(text: &str) -> bool {
    detect_injection(text).is_empty()
}

/// Sanitize a short fragment before embedding it into a prompt: filtered
/// marker when suspicious, collapsed whitespace otherwise.
pub fn sanitize_fragment(text: &str) -> String {
    let fragment = text.trim();
    if fragment.is_empty() {
        return String::new();
    }
    if !detect_injection(fragment).is_empty() {
        return "[filtered]".to_string();
    }
    fragment.split_whitespace().collect::<Vec<_>>().join(" ")
}
