//! Claim-level faithfulness
//!
//! Splits the answer into sentence-ish claims and measures how many are
//! lexically supported by at least one pack snippet. Citation markers,
//! urls, and boilerplate are ignored. The score is the supported
//! fraction; low scores surface as `unsupported_claim`.

use attest_retrieval::pack::Pack;

fn content_terms(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(str::to_string)
        .collect()
}

fn normalized(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn claim_supported(claim: &str, snippets: &[(String, Vec<String>)]) -> bool {
    // Verbatim containment either way counts as support; extractive
    // drafts quote their snippet directly.
    let claim_norm = normalized(claim);
    if !claim_norm.is_empty()
        && snippets.iter().any(|(snippet_norm, _)| {
            !snippet_norm.is_empty()
                && (claim_norm.contains(snippet_norm.as_str())
                    || snippet_norm.contains(claim_norm.as_str()))
        })
    {
        return true;
    }
    let terms = content_terms(claim);
    if terms.is_empty() {
        // No content-bearing words: nothing to support or contradict.
        return true;
    }
    snippets.iter().any(|(_, snippet_terms)| {
        let hits = terms.iter().filter(|t| snippet_terms.contains(t)).count();
        hits as f64 / terms.len() as f64 >= 0.5
    })
}

/// Faithfulness score in [0,1]: the fraction of claims supported by the
/// pack. An empty answer or empty pack scores 0.
pub fn compute_faithfulness(answer: &str, pack: &Pack) -> f64 {
    if answer.trim().is_empty() || pack.is_empty() {
        return 0.0;
    }
    let snippets: Vec<(String, Vec<String>)> = pack
        .items
        .iter()
        .map(|i| (normalized(&i.snippet), content_terms(&i.snippet)))
        .collect();
    // Urls fragment on '.' and are citations, not claims.
    let stripped = strip_urls(answer);
    // Claims with fewer than three content terms carry no checkable
    // assertion and are left out of the denominator.
    let claims: Vec<String> = stripped
        .split(['.', '!', '?', ';'])
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    let checkable: Vec<&String> = claims
        .iter()
        .filter(|c| content_terms(c).len() >= 3 || (claims.len() == 1 && !normalized(c).is_empty()))
        .collect();
    if checkable.is_empty() {
        return 1.0;
    }
    let supported = checkable
        .iter()
        .filter(|c| claim_supported(c, &snippets))
        .count();
    supported as f64 / checkable.len() as f64
}

fn strip_urls(text: &str) -> String {
    text.split_whitespace()
        .filter(|w| !w.starts_with("http://") && !w.starts_with("https://"))
        .collect::<Vec<_>>()
        .join(" ")
}
