//! Persistence of chain definitions and execution history.
//!
//! The orchestrator needs only `load_chain` and `save_execution`; the rest
//! backs the CLI's `save`, `exec` and `history` commands.

pub mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::models::{ChainDefinition, ExecutionRecord};

pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("No persistence configured")]
    NotConfigured,
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn load_chain(&self, chain_id: &str) -> Result<Option<ChainDefinition>, StoreError>;

    async fn save_chain(&self, chain: &ChainDefinition) -> Result<(), StoreError>;

    async fn save_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, StoreError>;

    /// Executions of one chain, most recent first.
    async fn list_executions(&self, chain_id: &str) -> Result<Vec<ExecutionRecord>, StoreError>;
}

/// Process-local store, for tests and one-shot runs.
#[derive(Default)]
pub struct InMemoryStore {
    chains: RwLock<HashMap<String, ChainDefinition>>,
    executions: RwLock<Vec<ExecutionRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for InMemoryStore {
    async fn load_chain(&self, chain_id: &str) -> Result<Option<ChainDefinition>, StoreError> {
        Ok(self.chains.read().await.get(chain_id).cloned())
    }

    async fn save_chain(&self, chain: &ChainDefinition) -> Result<(), StoreError> {
        self.chains
            .write()
            .await
            .insert(chain.id.clone(), chain.clone());
        Ok(())
    }

    async fn save_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        match executions
            .iter_mut()
            .find(|e| e.execution_id == record.execution_id)
        {
            Some(existing) => *existing = record.clone(),
            None => executions.push(record.clone()),
        }
        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(self
            .executions
            .read()
            .await
            .iter()
            .find(|e| e.execution_id == execution_id)
            .cloned())
    }

    async fn list_executions(&self, chain_id: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        let mut records: Vec<ExecutionRecord> = self
            .executions
            .read()
            .await
            .iter()
            .filter(|e| e.chain_id == chain_id)
            .cloned()
            .collect();
        records.reverse();
        Ok(records)
    }
}
