//! Vector search backends
//!
//! A minimal pluggable trait plus the in-memory flat backend used by
//! default. The flat backend scans every stored vector with cosine
//! similarity, which is exact and fast enough for per-workspace corpora;
//! ANN or external services implement the same trait.

use std::sync::RwLock;

use crate::embeddings::cosine;
use crate::errors::{Result, RetrievalError};

/// A scored hit from a vector backend.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub doc_id: String,
    /// Cosine similarity mapped to [0,1].
    pub score: f64,
}

/// Pluggable dense-search backend. Backends are shared across requests,
/// so mutation goes through interior mutability.
pub trait VectorBackend: Send + Sync {
    /// Add or replace a document vector.
    fn add(&self, doc_id: &str, vector: Vec<f32>) -> Result<()>;

    /// Return up to `k` hits sorted by score descending.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<VectorHit>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exact in-memory flat index.
#[derive(Debug, Default)]
pub struct FlatBackend {
    entries: RwLock<Vec<(String, Vec<f32>)>>,
}

impl FlatBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VectorBackend for FlatBackend {
    fn add(&self, doc_id: &str, vector: Vec<f32>) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| RetrievalError::vector("flat index poisoned"))?;
        if let Some(slot) = entries.iter_mut().find(|(id, _)| id == doc_id) {
            slot.1 = vector;
        } else {
            entries.push((doc_id.to_string(), vector));
        }
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| RetrievalError::vector("flat index poisoned"))?;
        let mut hits: Vec<VectorHit> = entries
            .iter()
            .map(|(id, vec)| VectorHit {
                doc_id: id.clone(),
                score: ((cosine(query, vec) + 1.0) / 2.0).clamp(0.0, 1.0),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{EmbeddingBackend, HashEmbedder};

    #[test]
    fn test_flat_backend_add_and_search() {
        let embedder = HashEmbedder::default();
        let backend = FlatBackend::new();
        backend
            .add("d1", embedder.embed("rust async runtime"))
            .unwrap();
        backend
            .add("d2", embedder.embed("gardening in spring"))
            .unwrap();

        let hits = backend
            .search(&embedder.embed("async rust tasks"), 2)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].doc_id, "d1");
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn test_flat_backend_replaces_existing() {
        let embedder = HashEmbedder::default();
        let backend = FlatBackend::new();
        backend.add("d1", embedder.embed("first")).unwrap();
        backend.add("d1", embedder.embed("second")).unwrap();
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_search_caps_results() {
        let embedder = HashEmbedder::default();
        let backend = FlatBackend::new();
        for i in 0..10 {
            backend
                .add(&format!("d{i}"), embedder.embed("same text everywhere"))
                .unwrap();
        }
        let hits = backend.search(&embedder.embed("same text"), 3).unwrap();
        assert_eq!(hits.len(), 3);
    }
}
