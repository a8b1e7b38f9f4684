//! Deterministic paraphrase surrogates
//!
//! With no generative model configured, paraphrase samples come from a
//! fixed template rotation over (answer, question, evidence). The first
//! sample is always the unmodified base answer so agreement is measured
//! against the actual draft.

fn clean(text: &str) -> String {
    text.trim().to_string()
}

fn render(template_index: usize, base: &str, question: &str, evidence: &str) -> String {
    match template_index % 8 {
        0 => base.to_string(),
        1 => format!("{base} (question: {question})"),
        2 => format!("In summary: {base}"),
        3 => format!("{base} - sourced from evidence: {evidence}"),
        4 => format!("Answering '{question}': {base}"),
        5 => format!("{base}. Key evidence: {evidence}"),
        6 => format!("{base} (context: {evidence})"),
        _ => format!("{base}. Confidence rests on: {evidence}"),
    }
}

/// Generate `count` (minimum 2) paraphrase variants of `base_answer`.
pub fn answer_variants(
    base_answer: &str,
    question: &str,
    evidence_snippets: &[String],
    count: usize,
) -> Vec<String> {
    let target = count.max(2);
    let base = {
        let c = clean(base_answer);
        if c.is_empty() {
            "No grounded answer yet.".to_string()
        } else {
            c
        }
    };
    let question = {
        let c = clean(question);
        if c.is_empty() {
            "Unknown question".to_string()
        } else {
            c
        }
    };
    let evidence: Vec<String> = {
        let cleaned: Vec<String> = evidence_snippets
            .iter()
            .map(|e| clean(e))
            .filter(|e| !e.is_empty())
            .collect();
        if cleaned.is_empty() {
            vec!["no supporting evidence available".to_string()]
        } else {
            cleaned
        }
    };

    let mut variants: Vec<String> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    let mut idx = 0usize;
    while variants.len() < target && idx <= 20 * target {
        let ev = &evidence[idx % evidence.len()];
        let rendered = render(idx, &base, &question, ev);
        let key = rendered.to_lowercase();
        if !seen.contains(&key) {
            seen.push(key);
            variants.push(rendered);
        }
        idx += 1;
    }
    // Pad if deduplication shortened the list.
    while variants.len() < target {
        variants.push(format!("{base} (variant {})", variants.len() + 1));
    }
    variants.truncate(target);
    variants
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_variant_is_base_answer() {
        let variants = answer_variants("X is Y.", "What is X?", &[], 5);
        assert_eq!(variants[0], "X is Y.");
        assert_eq!(variants.len(), 5);
    }

    #[test]
    fn test_variants_are_unique() {
        let variants = answer_variants(
            "X is Y.",
            "What is X?",
            &["evidence one".to_string(), "evidence two".to_string()],
            5,
        );
        let mut lowered: Vec<String> = variants.iter().map(|v| v.to_lowercase()).collect();
        lowered.sort();
        lowered.dedup();
        assert_eq!(lowered.len(), variants.len());
    }

    #[test]
    fn test_minimum_two_variants() {
        let variants = answer_variants("", "", &[], 0);
        assert_eq!(variants.len(), 2);
    }

    #[test]
    fn test_deterministic() {
        let a = answer_variants("ans", "q", &["e".to_string()], 4);
        let b = answer_variants("ans", "q", &["e".to_string()], 4);
        assert_eq!(a, b);
    }
}
