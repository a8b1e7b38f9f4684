//! Hybrid retriever over a workspace SQLite database
//!
//! Fuses three signals into one ranked evidence pack:
//! - sparse lexical score (FTS5 match or term-overlap fallback)
//! - dense cosine similarity over embeddings
//! - bounded entity-overlap boost from document metadata
//!
//! Failure semantics: a missing or broken vector backend degrades to
//! sparse-only (logged once per request); index errors yield an empty pack
//! so the caller can continue with a `missing_evidence` issue. Retrieval
//! never aborts a request.

pub mod embeddings;
pub mod errors;
pub mod lexical;
pub mod pack;
pub mod vector;

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::embeddings::{cosine, EmbeddingBackend, HashEmbedder};
use crate::errors::Result;
use crate::lexical::LexicalHit;
use crate::pack::{EvidenceItem, Pack, SourceType};
use crate::vector::VectorBackend;

pub use crate::embeddings::HashEmbedder as DefaultEmbedder;
pub use crate::errors::RetrievalError;
pub use crate::pack::{EvidenceItem as Evidence, Pack as EvidencePack};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Retriever tuning knobs. Weights come from the workspace policy overlay
/// with these defaults.
#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    /// Lexical hits pulled from memory before fusion.
    pub memory_k: usize,
    /// Lexical hits pulled from the corpus before fusion.
    pub corpus_k: usize,
    /// Final pack size, clamped to [1, 32].
    pub budget: usize,
    /// Hybrid-score floor below which candidates are dropped.
    pub min_score: f64,
    pub w_sparse: f64,
    pub w_dense: f64,
    /// Per-entity-match boost, capped at three matches.
    pub entity_boost: f64,
    /// Restrict memory hits to one domain.
    pub domain: Option<String>,
    /// Restrict the pack to one source type.
    pub source_filter: Option<SourceType>,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            memory_k: 8,
            corpus_k: 8,
            budget: 8,
            min_score: 0.1,
            w_sparse: 0.5,
            w_dense: 0.5,
            entity_boost: 0.15,
            domain: None,
            source_filter: None,
        }
    }
}

fn normalise_weights(w_sparse: f64, w_dense: f64) -> (f64, f64) {
    let ws = w_sparse.max(0.0);
    let wd = w_dense.max(0.0);
    let total = ws + wd;
    if total <= 0.0 {
        (1.0, 0.0)
    } else {
        (ws / total, wd / total)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Retriever
// ─────────────────────────────────────────────────────────────────────────────

/// Hybrid retriever. Cheap to clone per request; holds the embedding
/// backend and an optional dense backend shared across requests.
#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn EmbeddingBackend>,
    dense: Option<Arc<dyn VectorBackend>>,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn EmbeddingBackend>) -> Self {
        Self {
            embedder,
            dense: None,
        }
    }

    pub fn with_dense_backend(mut self, backend: Arc<dyn VectorBackend>) -> Self {
        self.dense = Some(backend);
        self
    }

    pub fn hash_default() -> Self {
        Self::new(Arc::new(HashEmbedder::default()))
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingBackend> {
        &self.embedder
    }

    /// Build a fused evidence pack for `query`.
    ///
    /// Lexical failures degrade to the other source; a failing dense
    /// backend degrades to sparse-only with a single warning.
    pub fn build_pack(
        &self,
        conn: &Connection,
        query: &str,
        config: &RetrieverConfig,
    ) -> Result<Pack> {
        if query.trim().is_empty() {
            return Ok(Pack::empty());
        }
        let budget = config.budget.clamp(1, 32);

        let memory_hits = match lexical::search_memory(
            conn,
            query,
            config.memory_k,
            config.domain.as_deref(),
        ) {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "memory search degraded to empty");
                Vec::new()
            }
        };
        let corpus_hits = match lexical::search_corpus(conn, query, config.corpus_k) {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "corpus search degraded to empty");
                Vec::new()
            }
        };

        let mut candidates: Vec<LexicalHit> = memory_hits;
        candidates.extend(corpus_hits);

        let query_vec = self.embedder.embed(query);

        // Dense backend can contribute candidates the lexical pass missed.
        if let Some(dense) = &self.dense {
            match dense.search(&query_vec, config.corpus_k.max(1)) {
                Ok(hits) if !hits.is_empty() => {
                    let ids: Vec<String> = hits.iter().map(|h| h.doc_id.clone()).collect();
                    match lexical::fetch_docs_by_ids(conn, &ids) {
                        Ok(mut docs) => {
                            let scores: HashMap<&str, f64> =
                                hits.iter().map(|h| (h.doc_id.as_str(), h.score)).collect();
                            for doc in &mut docs {
                                doc.score = scores.get(doc.id.as_str()).copied().unwrap_or(0.0);
                            }
                            candidates.extend(docs);
                        }
                        Err(e) => warn!(error = %e, "vector hit hydration failed"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "dense backend unavailable, sparse-only retrieval");
                }
            }
        }

        if candidates.is_empty() {
            return Ok(Pack::empty());
        }

        let (ws, wd) = normalise_weights(config.w_sparse, config.w_dense);
        let query_terms: Vec<String> = query
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();

        // Score, filter, and dedupe by normalized snippet hash. On a tie the
        // candidate with a url (or a corpus source) wins.
        let mut dedup: HashMap<String, EvidenceItem> = HashMap::new();
        for hit in candidates {
            if let Some(source) = config.source_filter {
                if hit.source != source {
                    continue;
                }
            }
            let snippet_vec = self.embedder.embed(&hit.snippet);
            let dense = ((cosine(&query_vec, &snippet_vec) + 1.0) / 2.0).clamp(0.0, 1.0);
            let sparse = hit.score.clamp(0.0, 1.0);
            let hybrid = ws * sparse + wd * dense;
            if hybrid < config.min_score {
                continue;
            }
            let bonus = entity_bonus(&query_terms, &hit.entities, config.entity_boost);
            let total = hybrid + bonus;
            let item = EvidenceItem {
                id: hit.id,
                snippet: hit.snippet,
                why: hit.why,
                score: total,
                source: hit.source,
                url: hit.url,
                title: hit.title,
                sparse_score: Some(sparse),
                dense_score: Some(dense),
                entity_bonus: (bonus > 0.0).then_some(bonus),
            };
            let key = snippet_key(&item.snippet);
            match dedup.get(&key) {
                None => {
                    dedup.insert(key, item);
                }
                Some(existing) => {
                    let better = item.score > existing.score + 1e-9
                        || ((item.score - existing.score).abs() <= 1e-9
                            && prefer_candidate(&item, existing));
                    if better {
                        dedup.insert(key, item);
                    }
                }
            }
        }

        let mut ranked: Vec<EvidenceItem> = dedup.into_values().collect();
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(budget);
        debug!(pack_len = ranked.len(), budget, "pack built");
        Ok(Pack { items: ranked })
    }
}

fn entity_bonus(query_terms: &[String], entities: &[String], weight: f64) -> f64 {
    if weight <= 0.0 || entities.is_empty() {
        return 0.0;
    }
    let matches = entities.iter().filter(|e| query_terms.contains(e)).count() as f64;
    if matches <= 0.0 {
        return 0.0;
    }
    (weight * matches).min(weight * 3.0)
}

/// Normalized snippet key used for deduplication: lowercase, leading
/// "label:" prefix stripped, tail-bounded, then hashed.
fn snippet_key(snippet: &str) -> String {
    let mut s = snippet.trim().to_lowercase();
    if let Some((idx, _)) = s.char_indices().take(60).find(|(_, c)| *c == ':') {
        s = s[idx + 1..].trim().to_string();
    }
    let tail: String = if s.chars().count() > 200 {
        let chars: Vec<char> = s.chars().collect();
        chars[chars.len() - 200..].iter().collect()
    } else {
        s
    };
    let mut hasher = Sha256::new();
    hasher.update(tail.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn prefer_candidate(new: &EvidenceItem, existing: &EvidenceItem) -> bool {
    if new.url.is_some() && existing.url.is_none() {
        return true;
    }
    new.source == SourceType::Corpus && existing.source != SourceType::Corpus
}
