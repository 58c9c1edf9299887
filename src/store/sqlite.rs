//! SQLite-backed strategy store implementation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::{JournalEntry, StrategyStore};
use crate::adaptive::{LearningStrategy, StrategyMetrics};
use crate::error::{Error, Result};

/// SQLite-backed strategy store.
///
/// Strategies upsert by `(primitive_type, name)`; the journal is
/// append-only. Parameters and metrics are stored as JSON columns so the
/// records stay readable with plain `sqlite3`.
pub struct SqliteStrategyStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStrategyStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::Storage(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Storage(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS strategies (
                primitive_type TEXT NOT NULL,
                name           TEXT NOT NULL,
                description    TEXT NOT NULL,
                context_pattern TEXT NOT NULL,
                context_key    TEXT NOT NULL,
                parameters     TEXT NOT NULL,
                metrics        TEXT NOT NULL,
                notes          TEXT,
                updated_at     TEXT NOT NULL,
                PRIMARY KEY (primitive_type, name)
            );
            CREATE TABLE IF NOT EXISTS journal (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp      TEXT NOT NULL,
                primitive_type TEXT NOT NULL,
                event          TEXT NOT NULL,
                note           TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_journal_primitive
                ON journal (primitive_type, id);",
        )
        .map_err(|e| Error::Storage(e.to_string()))
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        f(&conn).map_err(|e| Error::Storage(e.to_string()))
    }
}

#[async_trait]
impl StrategyStore for SqliteStrategyStore {
    async fn save_strategy(
        &self,
        primitive_type: &str,
        strategy: &LearningStrategy,
        context_key: &str,
        notes: Option<&str>,
    ) -> Result<()> {
        let parameters = serde_json::to_string(&strategy.parameters)?;
        let metrics = serde_json::to_string(&strategy.metrics)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO strategies (
                    primitive_type, name, description, context_pattern,
                    context_key, parameters, metrics, notes, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    primitive_type,
                    strategy.name,
                    strategy.description,
                    strategy.context_pattern,
                    context_key,
                    parameters,
                    metrics,
                    notes,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    async fn list_strategies(&self, primitive_type: &str) -> Result<Vec<LearningStrategy>> {
        let rows: Vec<(String, String, String, String, String)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, description, context_pattern, parameters, metrics
                 FROM strategies WHERE primitive_type = ?1 ORDER BY name",
            )?;
            let mapped = stmt.query_map(params![primitive_type], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?;
            mapped.collect()
        })?;

        let mut strategies = Vec::with_capacity(rows.len());
        for (name, description, context_pattern, parameters, metrics) in rows {
            let parameters: HashMap<String, serde_json::Value> =
                serde_json::from_str(&parameters)?;
            let metrics: StrategyMetrics = serde_json::from_str(&metrics)?;
            let mut strategy = LearningStrategy::new(name, description, context_pattern, parameters);
            strategy.metrics = metrics;
            strategies.push(strategy);
        }
        Ok(strategies)
    }

    async fn append_journal(&self, entry: &JournalEntry) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO journal (timestamp, primitive_type, event, note)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    entry.timestamp.to_rfc3339(),
                    entry.primitive_type,
                    entry.event,
                    entry.note,
                ],
            )?;
            Ok(())
        })
    }

    async fn journal(&self, primitive_type: &str) -> Result<Vec<JournalEntry>> {
        let rows: Vec<(String, String, String, String)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp, primitive_type, event, note
                 FROM journal WHERE primitive_type = ?1 ORDER BY id",
            )?;
            let mapped = stmt.query_map(params![primitive_type], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            mapped.collect()
        })?;

        let mut entries = Vec::with_capacity(rows.len());
        for (timestamp, primitive_type, event, note) in rows {
            let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                .map_err(|e| Error::Storage(format!("bad journal timestamp: {e}")))?
                .with_timezone(&Utc);
            entries.push(JournalEntry {
                timestamp,
                primitive_type,
                event,
                note,
            });
        }
        Ok(entries)
    }
}
