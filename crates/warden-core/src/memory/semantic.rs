//! Tier 3: durable vector store for similarity retrieval (sled, one tree per
//! persona namespace).
//!
//! Embeddings are computed locally with a deterministic feature-hashing
//! embedder: no model download, no network, stable across restarts. That keeps
//! the broker air-gapped while still giving useful nearest-neighbor recall over
//! document and log chunks. Search is brute-force cosine over the namespace
//! tree, with an optional lexical re-rank pass on the candidates.

use super::filter::clean_telemetry;
use crate::error::{WardenError, WardenResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;

/// Embedding dimension. Matches the small-sentence-model convention so a real
/// local embedder can replace the hashing one without a schema change.
pub const EMBEDDING_DIM: usize = 384;

/// One stored chunk with its embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticRecord {
    pub id: String,
    pub text: String,
    pub source: String,
    pub vector: Vec<f32>,
}

/// A similarity hit returned from search.
#[derive(Debug, Clone, Serialize)]
pub struct SemanticHit {
    pub id: String,
    pub text: String,
    pub source: String,
    pub score: f32,
}

pub struct SemanticStore {
    db: sled::Db,
}

impl SemanticStore {
    pub fn open(path: &Path) -> WardenResult<Self> {
        let db = sled::open(path)
            .map_err(|e| WardenError::MemoryWriteFailure(format!("open semantic store: {e}")))?;
        Ok(Self { db })
    }

    fn tree(&self, namespace: &str) -> WardenResult<sled::Tree> {
        self.db
            .open_tree(namespace)
            .map_err(|e| WardenError::MemoryWriteFailure(format!("open namespace tree: {e}")))
    }

    /// Store one chunk under a persona namespace. Text is scrubbed before the
    /// embedding is computed so the redacted form is what both tiers see.
    pub fn add(&self, namespace: &str, text: &str, source: &str) -> WardenResult<String> {
        let text = clean_telemetry(text);
        let record = SemanticRecord {
            id: uuid::Uuid::new_v4().to_string(),
            vector: embed_text(&text),
            text,
            source: source.to_string(),
        };
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| WardenError::MemoryWriteFailure(format!("encode record: {e}")))?;
        let tree = self.tree(namespace)?;
        tree.insert(record.id.as_bytes(), bytes)
            .map_err(|e| WardenError::MemoryWriteFailure(format!("insert record: {e}")))?;
        tree.flush()
            .map_err(|e| WardenError::MemoryWriteFailure(format!("flush namespace: {e}")))?;
        Ok(record.id)
    }

    /// Cosine top-k over one namespace.
    pub fn search(&self, namespace: &str, query: &str, limit: usize) -> WardenResult<Vec<SemanticHit>> {
        let query_vec = embed_text(query);
        let tree = self.tree(namespace)?;
        let mut hits: Vec<SemanticHit> = Vec::new();
        for entry in tree.iter() {
            let (_, value) =
                entry.map_err(|e| WardenError::Io(std::io::Error::other(format!("scan: {e}"))))?;
            let record: SemanticRecord = match serde_json::from_slice(&value) {
                Ok(r) => r,
                Err(_) => continue, // skip undecodable rows rather than failing retrieval
            };
            let score = cosine(&query_vec, &record.vector);
            hits.push(SemanticHit {
                id: record.id,
                text: record.text,
                source: record.source,
                score,
            });
        }
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    /// Record count for one namespace. Status endpoint helper.
    pub fn count(&self, namespace: &str) -> WardenResult<u64> {
        Ok(self.tree(namespace)?.len() as u64)
    }
}

/// Re-rank similarity candidates by lexical overlap with the query, blending
/// the cosine score with token Jaccard. Keeps at most `top_k`.
pub fn rerank(query: &str, mut hits: Vec<SemanticHit>, top_k: usize) -> Vec<SemanticHit> {
    let query_tokens: HashSet<String> = tokens(query).collect();
    if query_tokens.is_empty() {
        hits.truncate(top_k);
        return hits;
    }
    for hit in &mut hits {
        let doc_tokens: HashSet<String> = tokens(&hit.text).collect();
        let inter = query_tokens.intersection(&doc_tokens).count() as f32;
        let union = query_tokens.union(&doc_tokens).count() as f32;
        let jaccard = if union > 0.0 { inter / union } else { 0.0 };
        hit.score = 0.5 * hit.score + 0.5 * jaccard;
    }
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(top_k);
    hits
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Deterministic feature-hashing embedder: each token (and adjacent bigram)
/// hashes to one dimension with a hash-derived sign, then the vector is
/// L2-normalized.
pub fn embed_text(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    let toks: Vec<String> = tokens(text).collect();
    for tok in &toks {
        bump(&mut v, tok);
    }
    for pair in toks.windows(2) {
        bump(&mut v, &format!("{} {}", pair[0], pair[1]));
    }
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

fn bump(v: &mut [f32], feature: &str) {
    let digest = Sha256::digest(feature.as_bytes());
    let h = u64::from_le_bytes(digest[..8].try_into().expect("8 digest bytes"));
    let idx = (h % EMBEDDING_DIM as u64) as usize;
    let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
    v[idx] += sign;
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    // Stored and query vectors are already normalized.
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
