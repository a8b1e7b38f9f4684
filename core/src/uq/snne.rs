//! Semantic nearest-neighbor entropy
//!
//! raw = -mean_i( log sum_j exp(sim(i,j) / tau) )
//!
//! over unit-normalized sample embeddings. High mutual similarity drives
//! the log-sum-exp up and the raw score down; the logistic map therefore
//! sends confident (very negative) raw scores toward 1.

use attest_retrieval::embeddings::EmbeddingBackend;

/// Compute the raw SNNE score for a set of paraphrase samples.
///
/// Returns `None` for fewer than two samples; a single sample carries no
/// agreement signal and is treated as maximum uncertainty upstream.
pub fn snne_raw(samples: &[String], tau: f64, embedder: &dyn EmbeddingBackend) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let tau = tau.max(1e-6);
    let vectors: Vec<Vec<f32>> = samples.iter().map(|s| embedder.embed(s)).collect();

    let n = vectors.len();
    let mut total_lse = 0.0f64;
    for i in 0..n {
        let mut row_sum = 0.0f64;
        for j in 0..n {
            let sim = attest_retrieval::embeddings::cosine(&vectors[i], &vectors[j]);
            row_sum += (sim / tau).exp();
        }
        total_lse += row_sum.ln();
    }
    Some(-(total_lse / n as f64))
}

/// Logistic squash of the raw score into a confidence in [0,1].
pub fn normalize(raw: f64) -> f64 {
    if raw.is_nan() {
        return 0.0;
    }
    (1.0 / (1.0 + raw.exp())).clamp(0.0, 1.0)
}
