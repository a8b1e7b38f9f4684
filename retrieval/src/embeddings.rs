//! Embedding backends
//!
//! The engine never requires a remote embedding service: the default
//! backend is a deterministic token-hash bag, normalized to unit length,
//! which gives stable cosine geometry for tests and offline deployments.
//! Remote backends plug in through [`EmbeddingBackend`].

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Pluggable text-embedding backend.
///
/// Implementations must be deterministic for a given input within one
/// process run; calibration assumes a fixed embedding geometry.
pub trait EmbeddingBackend: Send + Sync {
    /// Embed text into a unit-normalized vector.
    fn embed(&self, text: &str) -> Vec<f32>;

    /// Dimensionality of produced vectors.
    fn dim(&self) -> usize;

    /// Identifier recorded alongside stored embeddings so a backend swap
    /// can be detected as a calibration break.
    fn model_id(&self) -> &str;
}

/// Deterministic hashing embedder (token-hash bag, L2-normalized).
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

impl EmbeddingBackend for HashEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dim];
        for token in text.to_lowercase().split_whitespace() {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let slot = (hasher.finish() as usize) % self.dim;
            vec[slot] += 1.0;
        }
        normalize(&mut vec);
        vec
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn model_id(&self) -> &str {
        "hash-bag-v1"
    }
}

fn normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

/// Cosine similarity; mismatched dimensions compare over the common prefix.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for i in 0..n {
        dot += f64::from(a[i]) * f64::from(b[i]);
        na += f64::from(a[i]) * f64::from(a[i]);
        nb += f64::from(b[i]) * f64::from(b[i]);
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    dot / denom
}
