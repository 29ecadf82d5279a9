//! Durable tier of the trace store.
//!
//! A key-value substrate keyed by the literal node-id string, holding one
//! [`PersistedTrace`] per node. It only has to survive an in-session reload:
//! every implementation starts empty.
//!
//! All methods are synchronous; the store actor calls them from
//! `tokio::task::spawn_blocking`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use shared_types::{AgentNodeId, PersistedTrace};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DurableTierError {
    #[error("durable tier storage error: {0}")]
    Storage(String),

    #[error("durable tier serialization error: {0}")]
    Serialization(String),

    #[error("durable tier unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for DurableTierError {
    fn from(e: rusqlite::Error) -> Self {
        DurableTierError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for DurableTierError {
    fn from(e: serde_json::Error) -> Self {
        DurableTierError::Serialization(e.to_string())
    }
}

pub trait DurableTier: Send {
    /// Insert or replace the record of `record.trace_group.agent_id`.
    fn put(&mut self, record: &PersistedTrace) -> Result<(), DurableTierError>;

    fn get(&self, node: AgentNodeId) -> Result<Option<PersistedTrace>, DurableTierError>;

    fn load_all(&self) -> Result<Vec<PersistedTrace>, DurableTierError>;

    fn remove(&mut self, node: AgentNodeId) -> Result<(), DurableTierError>;

    fn clear(&mut self) -> Result<(), DurableTierError>;
}

fn decode(node_key: &str, json: &str) -> Option<PersistedTrace> {
    match serde_json::from_str::<PersistedTrace>(json) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(node_id = %node_key, error = %e, "Skipping unreadable durable record");
            None
        }
    }
}

// ─── SQLite ──────────────────────────────────────────────────────────────────

/// Thin wrapper around a rusqlite Connection.
pub struct SqliteTier {
    conn: rusqlite::Connection,
}

impl SqliteTier {
    /// Open (or create) the tier at the given SQLite path and wipe it.
    /// Use `":memory:"` for in-process stores.
    pub fn open(path: &str) -> Result<Self, DurableTierError> {
        let conn = if path == ":memory:" {
            rusqlite::Connection::open_in_memory()?
        } else {
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent).ok();
            }
            rusqlite::Connection::open(path)?
        };

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS trace_cache (
                node_id TEXT PRIMARY KEY,
                record TEXT NOT NULL,
                session_id TEXT,
                last_updated INTEGER NOT NULL
            );
            DELETE FROM trace_cache;
            "#,
        )?;

        Ok(SqliteTier { conn })
    }
}

impl DurableTier for SqliteTier {
    fn put(&mut self, record: &PersistedTrace) -> Result<(), DurableTierError> {
        let json = serde_json::to_string(record)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO trace_cache(node_id, record, session_id, last_updated) VALUES (?, ?, ?, ?)",
            rusqlite::params![
                record.trace_group.agent_id.as_str(),
                json,
                record.session_id,
                record.last_updated
            ],
        )?;
        Ok(())
    }

    fn get(&self, node: AgentNodeId) -> Result<Option<PersistedTrace>, DurableTierError> {
        let mut stmt = self
            .conn
            .prepare("SELECT record FROM trace_cache WHERE node_id = ? LIMIT 1")?;
        let mut rows = stmt.query(rusqlite::params![node.as_str()])?;
        match rows.next()? {
            Some(row) => {
                let json: String = row.get(0)?;
                Ok(decode(node.as_str(), &json))
            }
            None => Ok(None),
        }
    }

    fn load_all(&self) -> Result<Vec<PersistedTrace>, DurableTierError> {
        let mut stmt = self
            .conn
            .prepare("SELECT node_id, record FROM trace_cache ORDER BY node_id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .iter()
            .filter_map(|(node_key, json)| decode(node_key, json))
            .collect())
    }

    fn remove(&mut self, node: AgentNodeId) -> Result<(), DurableTierError> {
        self.conn.execute(
            "DELETE FROM trace_cache WHERE node_id = ?",
            rusqlite::params![node.as_str()],
        )?;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), DurableTierError> {
        self.conn.execute("DELETE FROM trace_cache", [])?;
        Ok(())
    }
}

// ─── In-memory ───────────────────────────────────────────────────────────────

/// Shared in-memory tier. Clones see the same records, which lets a test play
/// the part of another writer.
#[derive(Debug, Clone, Default)]
pub struct MemoryTier {
    records: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_records<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, String>) -> Result<T, DurableTierError>,
    ) -> Result<T, DurableTierError> {
        let mut guard = self
            .records
            .lock()
            .map_err(|e| DurableTierError::Unavailable(e.to_string()))?;
        f(&mut guard)
    }

    /// Store a raw JSON value under a node key, bypassing the trace store.
    pub fn insert_raw(&self, node_key: &str, json: String) -> Result<(), DurableTierError> {
        self.with_records(|records| {
            records.insert(node_key.to_string(), json);
            Ok(())
        })
    }

    pub fn keys(&self) -> Vec<String> {
        self.with_records(|records| Ok(records.keys().cloned().collect()))
            .unwrap_or_default()
    }
}

impl DurableTier for MemoryTier {
    fn put(&mut self, record: &PersistedTrace) -> Result<(), DurableTierError> {
        let json = serde_json::to_string(record)?;
        self.insert_raw(record.trace_group.agent_id.as_str(), json)
    }

    fn get(&self, node: AgentNodeId) -> Result<Option<PersistedTrace>, DurableTierError> {
        self.with_records(|records| {
            Ok(records
                .get(node.as_str())
                .and_then(|json| decode(node.as_str(), json)))
        })
    }

    fn load_all(&self) -> Result<Vec<PersistedTrace>, DurableTierError> {
        self.with_records(|records| {
            Ok(records
                .iter()
                .filter_map(|(node_key, json)| decode(node_key, json))
                .collect())
        })
    }

    fn remove(&mut self, node: AgentNodeId) -> Result<(), DurableTierError> {
        self.with_records(|records| {
            records.remove(node.as_str());
            Ok(())
        })
    }

    fn clear(&mut self) -> Result<(), DurableTierError> {
        self.with_records(|records| {
            records.clear();
            Ok(())
        })
    }
}
