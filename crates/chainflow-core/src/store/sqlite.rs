//! SQLite persistence.
//!
//! Uses rusqlite with WAL mode for concurrent read performance. All database
//! operations are executed via `tokio::task::spawn_blocking` to avoid
//! blocking the async runtime. Definitions and records are stored as JSON
//! next to a few indexed columns.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};

use super::{Persistence, StoreError};
use crate::models::{ChainDefinition, ExecutionRecord};

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, StoreError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| StoreError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| StoreError::Database(format!("Failed to set pragmas: {}", e)))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_tables()?;

        tracing::info!("[SqliteStore] Database opened at: {}", db_path);
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Database(format!("Failed to open in-memory db: {}", e)))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_tables()?;
        Ok(store)
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn with_conn_async<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| StoreError::Database(format!("Task join error: {}", e)))?
    }

    fn initialize_tables(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS chains (
                    id              TEXT PRIMARY KEY,
                    name            TEXT NOT NULL,
                    mode            TEXT NOT NULL,
                    definition      TEXT NOT NULL,
                    updated_at      INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS executions (
                    id              TEXT PRIMARY KEY,
                    chain_id        TEXT NOT NULL,
                    status          TEXT NOT NULL,
                    record          TEXT NOT NULL,
                    started_at      INTEGER,
                    ended_at        INTEGER,
                    created_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_executions_chain ON executions(chain_id);
                ",
            )
        })
    }
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn load_chain(&self, chain_id: &str) -> Result<Option<ChainDefinition>, StoreError> {
        let id = chain_id.to_string();
        let json: Option<String> = self
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT definition FROM chains WHERE id = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        json.map(|s| serde_json::from_str(&s).map_err(StoreError::from))
            .transpose()
    }

    async fn save_chain(&self, chain: &ChainDefinition) -> Result<(), StoreError> {
        let definition = serde_json::to_string(chain)?;
        let (id, name, mode) = (
            chain.id.clone(),
            chain.name.clone(),
            chain.mode.as_str().to_string(),
        );
        let now = chrono::Utc::now().timestamp_millis();
        self.with_conn_async(move |conn| {
            conn.execute(
                "INSERT INTO chains (id, name, mode, definition, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                   name = excluded.name,
                   mode = excluded.mode,
                   definition = excluded.definition,
                   updated_at = excluded.updated_at",
                rusqlite::params![id, name, mode, definition, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn save_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        let (id, chain_id, status) = (
            record.execution_id.clone(),
            record.chain_id.clone(),
            record.status.as_str().to_string(),
        );
        let started = record.started_at.map(|t| t.timestamp_millis());
        let ended = record.ended_at.map(|t| t.timestamp_millis());
        let now = chrono::Utc::now().timestamp_millis();
        self.with_conn_async(move |conn| {
            conn.execute(
                "INSERT INTO executions (id, chain_id, status, record, started_at, ended_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                   status = excluded.status,
                   record = excluded.record,
                   started_at = excluded.started_at,
                   ended_at = excluded.ended_at",
                rusqlite::params![id, chain_id, status, json, started, ended, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        let id = execution_id.to_string();
        let json: Option<String> = self
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT record FROM executions WHERE id = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        json.map(|s| serde_json::from_str(&s).map_err(StoreError::from))
            .transpose()
    }

    async fn list_executions(&self, chain_id: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        let id = chain_id.to_string();
        let rows: Vec<String> = self
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT record FROM executions WHERE chain_id = ?1
                     ORDER BY created_at DESC, rowid DESC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![id], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for json in rows {
            match serde_json::from_str::<ExecutionRecord>(&json) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("[SqliteStore] Skipping unreadable execution row: {}", e),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentRef, AgentStepSpec, ExecutionMode, ExecutionStatus};

    fn chain() -> ChainDefinition {
        ChainDefinition::new("chain-1", "demo", ExecutionMode::Conditional)
            .with_step(AgentStepSpec::new(AgentRef::new("researcher", "Research"), 1))
            .with_step(AgentStepSpec::new(AgentRef::id("answerer"), 2).with_condition("step_1_result"))
    }

    #[tokio::test]
    async fn test_chain_upsert_and_load() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut def = chain();
        store.save_chain(&def).await.unwrap();

        def.name = "renamed".to_string();
        store.save_chain(&def).await.unwrap();

        let loaded = store.load_chain("chain-1").await.unwrap().unwrap();
        assert_eq!(loaded, def);
        assert!(store.load_chain("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_execution_history_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("chainflow.db");
        let store = SqliteStore::open(path.to_str().unwrap()).unwrap();

        let mut record = ExecutionRecord::new("chain-1", ExecutionMode::Sequential);
        record.start();
        store.save_execution(&record).await.unwrap();
        record.complete(Some(serde_json::json!("answer")));
        store.save_execution(&record).await.unwrap();

        let other = ExecutionRecord::new("chain-2", ExecutionMode::Parallel);
        store.save_execution(&other).await.unwrap();

        let listed = store.list_executions("chain-1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, ExecutionStatus::Completed);
        assert_eq!(listed[0].result, Some(serde_json::json!("answer")));

        let fetched = store.get_execution(&other.execution_id).await.unwrap();
        assert_eq!(fetched.map(|r| r.mode), Some(ExecutionMode::Parallel));
    }
}
