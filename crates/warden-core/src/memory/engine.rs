//! Three-tier memory facade.
//!
//! Tier 1 is the in-process LRU for hot goal context, tier 2 the durable
//! FTS-indexed fact store, tier 3 the vector store. Retrieval fans out to
//! tiers 2 and 3 concurrently and reports per-tier latency to the audit sink.
//! All writes pass through telemetry scrubbing inside the stores themselves,
//! so nothing the engine persists can carry a phone-home payload.

use super::cache::ContextCache;
use super::facts::{FactRecord, FactStore};
use super::semantic::{rerank, SemanticHit, SemanticStore};
use crate::audit::AuditSink;
use crate::config::CoreConfig;
use crate::error::{WardenError, WardenResult};
use crate::persona::Persona;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Default number of candidates pulled from tier 3 before lexical re-rank.
const SEMANTIC_CANDIDATES: usize = 16;

/// Combined retrieval output across the tiers.
#[derive(Debug, Serialize)]
pub struct Retrieval {
    /// Tier-1 hit for the exact query key, if any.
    pub cached: Option<String>,
    pub facts: Vec<FactRecord>,
    pub semantic: Vec<SemanticHit>,
}

/// Per-namespace record counts for the status endpoint.
#[derive(Debug, Serialize)]
pub struct NamespaceStatus {
    pub persona: String,
    pub facts: u64,
    pub semantic: u64,
}

#[derive(Debug, Serialize)]
pub struct MemoryStatus {
    pub cache_entries: usize,
    pub namespaces: Vec<NamespaceStatus>,
}

pub struct MemoryEngine {
    cache: ContextCache,
    facts: Arc<FactStore>,
    semantic: Arc<SemanticStore>,
    audit: Arc<AuditSink>,
    /// One writer at a time per persona namespace. Readers are unaffected.
    write_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MemoryEngine {
    pub fn open(config: &CoreConfig, audit: Arc<AuditSink>) -> WardenResult<Self> {
        std::fs::create_dir_all(&config.storage_dir)?;
        Ok(Self {
            cache: ContextCache::new(config.l1_capacity),
            facts: Arc::new(FactStore::new(config.facts_db_path())?),
            semantic: Arc::new(SemanticStore::open(&config.semantic_db_path())?),
            audit,
            write_locks: DashMap::new(),
        })
    }

    fn write_lock(&self, namespace: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Cache the accepted goal text and persist it as a fact so later goals in
    /// the same namespace can retrieve it.
    pub async fn remember_goal(&self, persona: Persona, goal_id: &str, goal: &str) -> WardenResult<()> {
        let ns = persona.namespace();
        self.cache.put(goal, goal);
        let lock = self.write_lock(ns);
        let _guard = lock.lock().await;
        self.facts
            .add(ns, goal, &format!("goal:{goal_id}"))
            .map(|_| ())
    }

    pub async fn add_fact(&self, persona: Persona, body: &str, tags: &str) -> WardenResult<String> {
        let ns = persona.namespace();
        let lock = self.write_lock(ns);
        let _guard = lock.lock().await;
        self.facts.add(ns, body, tags)
    }

    pub async fn add_document(&self, persona: Persona, text: &str, source: &str) -> WardenResult<String> {
        let ns = persona.namespace();
        let lock = self.write_lock(ns);
        let _guard = lock.lock().await;
        self.semantic.add(ns, text, source)
    }

    /// Fan out to tiers 2 and 3 concurrently, re-rank the vector candidates
    /// lexically, and record per-tier plus combined latency.
    pub async fn retrieve(&self, persona: Persona, query: &str, limit: usize) -> WardenResult<Retrieval> {
        let ns = persona.namespace();
        let combined_start = Instant::now();
        let cached = self.cache.get(query);

        let facts_store = Arc::clone(&self.facts);
        let semantic_store = Arc::clone(&self.semantic);
        let (fact_ns, fact_query) = (ns.to_string(), query.to_string());
        let (sem_ns, sem_query) = (ns.to_string(), query.to_string());

        let facts_task = tokio::task::spawn_blocking(move || {
            let start = Instant::now();
            let rows = facts_store.search(&fact_ns, &fact_query, limit);
            (rows, start.elapsed())
        });
        let semantic_task = tokio::task::spawn_blocking(move || {
            let start = Instant::now();
            let hits = semantic_store.search(&sem_ns, &sem_query, SEMANTIC_CANDIDATES);
            (hits, start.elapsed())
        });

        let (facts_out, semantic_out) = tokio::join!(facts_task, semantic_task);
        let (facts, facts_elapsed) = facts_out
            .map_err(|e| WardenError::MemoryWriteFailure(format!("fact retrieval task: {e}")))?;
        let (semantic, semantic_elapsed) = semantic_out
            .map_err(|e| WardenError::MemoryWriteFailure(format!("semantic retrieval task: {e}")))?;

        let facts = facts?;
        let semantic = rerank(query, semantic?, limit);

        self.audit
            .record_retrieval_seconds("facts", facts_elapsed.as_secs_f64());
        self.audit
            .record_retrieval_seconds("semantic", semantic_elapsed.as_secs_f64());
        self.audit
            .record_retrieval_seconds("combined", combined_start.elapsed().as_secs_f64());

        Ok(Retrieval {
            cached,
            facts,
            semantic,
        })
    }

    /// Record counts across every persona namespace plus the live cache size.
    pub fn status(&self) -> WardenResult<MemoryStatus> {
        let mut namespaces = Vec::new();
        for persona in crate::persona::ALL_PERSONAS {
            let ns = persona.namespace();
            namespaces.push(NamespaceStatus {
                persona: persona.as_str().to_string(),
                facts: self.facts.count(ns)?,
                semantic: self.semantic.count(ns)?,
            });
        }
        Ok(MemoryStatus {
            cache_entries: self.cache.len(),
            namespaces,
        })
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(dir: &std::path::Path) -> MemoryEngine {
        let config = CoreConfig {
            storage_dir: dir.to_path_buf(),
            l1_capacity: 8,
            ..Default::default()
        };
        let audit = Arc::new(AuditSink::new(&config.audit_dir()));
        MemoryEngine::open(&config, audit).unwrap()
    }

    #[tokio::test]
    async fn goal_is_cached_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine
            .remember_goal(Persona::Sre, "g-1", "drain node x-7 for maintenance")
            .await
            .unwrap();

        let out = engine
            .retrieve(Persona::Sre, "drain node x-7 for maintenance", 5)
            .await
            .unwrap();
        assert!(out.cached.is_some());
        assert!(out.facts.iter().any(|f| f.body.contains("x-7")));
    }

    #[tokio::test]
    async fn retrieval_spans_both_durable_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine
            .add_fact(Persona::Secops, "vault policy audit-read granted to ci", "vault")
            .await
            .unwrap();
        engine
            .add_document(
                Persona::Secops,
                "runbook: rotating the vault audit-read policy",
                "runbook",
            )
            .await
            .unwrap();

        let out = engine
            .retrieve(Persona::Secops, "vault audit-read policy", 5)
            .await
            .unwrap();
        assert_eq!(out.facts.len(), 1);
        assert!(!out.semantic.is_empty());
    }

    #[tokio::test]
    async fn namespaces_do_not_leak_across_personas() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine
            .add_fact(Persona::Sre, "cluster api endpoint rotated", "infra")
            .await
            .unwrap();

        let out = engine
            .retrieve(Persona::Analyst, "cluster api endpoint", 5)
            .await
            .unwrap();
        assert!(out.facts.is_empty());
        assert!(out.semantic.is_empty());
    }

    #[tokio::test]
    async fn status_reports_per_namespace_counts() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine
            .add_fact(Persona::Sre, "one fact", "t")
            .await
            .unwrap();
        engine
            .add_document(Persona::Sre, "one document", "doc")
            .await
            .unwrap();

        let status = engine.status().unwrap();
        let sre = status
            .namespaces
            .iter()
            .find(|n| n.persona == "sre")
            .unwrap();
        assert_eq!(sre.facts, 1);
        assert_eq!(sre.semantic, 1);
        let analyst = status
            .namespaces
            .iter()
            .find(|n| n.persona == "analyst")
            .unwrap();
        assert_eq!(analyst.facts, 0);
    }
}
