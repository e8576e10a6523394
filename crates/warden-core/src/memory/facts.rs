//! Tier 2: durable structured facts with full-text search (SQLite FTS5).
//!
//! Bare-metal local DB, namespaced per persona so personas never read each
//! other's facts. Connections are opened per call: reads run concurrently on
//! their own connections while the engine serializes writes per namespace.

use super::filter::clean_telemetry;
use crate::error::{WardenError, WardenResult};
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// One discrete fact, e.g. "node x-7 is in maintenance".
#[derive(Debug, Clone, Serialize)]
pub struct FactRecord {
    pub id: String,
    pub namespace: String,
    pub body: String,
    pub tags: String,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct FactStore {
    db_path: PathBuf,
}

impl FactStore {
    pub fn new(db_path: PathBuf) -> WardenResult<Self> {
        let store = Self { db_path };
        store.init()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn open(&self) -> WardenResult<Connection> {
        Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|e| WardenError::MemoryWriteFailure(format!("open facts db: {e}")))
    }

    fn init(&self) -> WardenResult<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS facts (
                id TEXT PRIMARY KEY,
                namespace TEXT NOT NULL,
                body TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            );

            CREATE INDEX IF NOT EXISTS idx_facts_namespace ON facts(namespace);

            CREATE VIRTUAL TABLE IF NOT EXISTS facts_fts USING fts5(
                body,
                tags,
                content='facts',
                content_rowid='rowid'
            );

            CREATE TRIGGER IF NOT EXISTS facts_ai AFTER INSERT ON facts BEGIN
                INSERT INTO facts_fts(rowid, body, tags) VALUES (new.rowid, new.body, new.tags);
            END;

            CREATE TRIGGER IF NOT EXISTS facts_ad AFTER DELETE ON facts BEGIN
                INSERT INTO facts_fts(facts_fts, rowid, body, tags)
                VALUES ('delete', old.rowid, old.body, old.tags);
            END;
            "#,
        )
        .map_err(|e| WardenError::MemoryWriteFailure(format!("init facts schema: {e}")))?;
        Ok(())
    }

    /// Insert one fact. The body is scrubbed before it becomes durable; this is
    /// the invariant, not a courtesy.
    pub fn add(&self, namespace: &str, body: &str, tags: &str) -> WardenResult<String> {
        let body = clean_telemetry(body);
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO facts (id, namespace, body, tags) VALUES (?1, ?2, ?3, ?4)",
            params![id, namespace, body, tags],
        )
        .map_err(|e| WardenError::MemoryWriteFailure(format!("insert fact: {e}")))?;
        Ok(id)
    }

    /// Full-text search scoped to one namespace, best rank first.
    pub fn search(&self, namespace: &str, query: &str, limit: usize) -> WardenResult<Vec<FactRecord>> {
        let fts_query = match sanitize_fts_query(query) {
            Some(q) => q,
            None => return Ok(Vec::new()),
        };
        let conn = self.open()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT f.id, f.namespace, f.body, f.tags, f.created_at
                FROM facts_fts fts
                JOIN facts f ON f.rowid = fts.rowid
                WHERE facts_fts MATCH ?1 AND f.namespace = ?2
                ORDER BY rank
                LIMIT ?3
                "#,
            )
            .map_err(to_read_err)?;
        let rows = stmt
            .query_map(params![fts_query, namespace, limit as i64], |row| {
                Ok(FactRecord {
                    id: row.get(0)?,
                    namespace: row.get(1)?,
                    body: row.get(2)?,
                    tags: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .map_err(to_read_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(to_read_err)?);
        }
        Ok(out)
    }

    /// Record count for one namespace. Status endpoint helper.
    pub fn count(&self, namespace: &str) -> WardenResult<u64> {
        let conn = self.open()?;
        conn.query_row(
            "SELECT COUNT(*) FROM facts WHERE namespace = ?1",
            params![namespace],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as u64)
        .map_err(to_read_err)
    }
}

fn to_read_err(e: rusqlite::Error) -> WardenError {
    WardenError::Io(std::io::Error::other(format!("facts read: {e}")))
}

/// FTS5 treats hyphens and operators as syntax. Reduce free text to quoted
/// terms OR-ed together so arbitrary goal text can never break the query.
fn sanitize_fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FactStore::new(dir.path().join("facts.sqlite3")).unwrap();
        (dir, store)
    }

    #[test]
    fn add_and_search() {
        let (_dir, store) = store();
        store.add("sre", "node x-7 is in maintenance", "infra").unwrap();
        store.add("sre", "cluster alpha runs kubernetes 1.29", "infra").unwrap();

        let hits = store.search("sre", "maintenance", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].body.contains("x-7"));
    }

    #[test]
    fn namespaces_are_isolated() {
        let (_dir, store) = store();
        store.add("sre", "shared secret rotation friday", "").unwrap();
        let hits = store.search("secops", "rotation", 10).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn hyphenated_query_does_not_break_fts() {
        let (_dir, store) = store();
        store.add("sre", "deployment web-frontend scaled to 3", "").unwrap();
        let hits = store.search("sre", "delete-deployment web-frontend", 10).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn writes_are_scrubbed() {
        let (_dir, store) = store();
        store.add("sre", "ingest failed, api_key=sk-oops retry later", "").unwrap();
        let hits = store.search("sre", "ingest retry", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(!hits[0].body.contains("sk-oops"));
    }

    #[test]
    fn empty_query_returns_empty() {
        let (_dir, store) = store();
        store.add("sre", "anything", "").unwrap();
        assert!(store.search("sre", "  --- ", 10).unwrap().is_empty());
    }

    #[test]
    fn count_per_namespace() {
        let (_dir, store) = store();
        store.add("sre", "a", "").unwrap();
        store.add("sre", "b", "").unwrap();
        store.add("secops", "c", "").unwrap();
        assert_eq!(store.count("sre").unwrap(), 2);
        assert_eq!(store.count("secops").unwrap(), 1);
        assert_eq!(store.count("analyst").unwrap(), 0);
    }
}
