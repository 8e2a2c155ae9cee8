//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and drives the
//! chainflow-core orchestrator.

pub mod history;
pub mod run;
pub mod validate;

use std::sync::Arc;

use chainflow_core::store::SqliteStore;
use chainflow_core::{AgentRegistry, ChainDefinition, ChainOrchestrator};

use crate::agents::{AgentsFile, EchoAgent};

/// Open the SQLite store at the given path.
pub fn open_store(db_path: &str) -> Result<SqliteStore, String> {
    SqliteStore::open(db_path).map_err(|e| format!("Failed to open database '{}': {}", db_path, e))
}

/// Build the agent registry from the agents file, or, without one, register
/// an echo agent for every agent the chain references (dry run).
pub fn load_registry(
    agents_file: Option<&str>,
    chain: &ChainDefinition,
) -> Result<AgentRegistry, String> {
    if let Some(path) = agents_file {
        return AgentsFile::from_file(path)?.into_registry();
    }

    tracing::warn!("[CLI] No agents file given, running chain '{}' with echo agents", chain.id);
    let mut registry = AgentRegistry::new();
    for step in &chain.steps {
        let refs = std::iter::once(&step.agent)
            .chain(step.fallback.as_ref().and_then(|f| f.agent.as_ref()));
        for agent_ref in refs {
            if registry.resolve(agent_ref).is_none() {
                registry.register(
                    agent_ref.id.clone(),
                    agent_ref.label().to_string(),
                    Arc::new(EchoAgent::new("")),
                );
            }
        }
    }
    Ok(registry)
}

/// Orchestrator wired to the SQLite store.
pub fn orchestrator(registry: AgentRegistry, store: SqliteStore) -> ChainOrchestrator {
    ChainOrchestrator::new(Arc::new(registry)).with_persistence(Arc::new(store))
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}
