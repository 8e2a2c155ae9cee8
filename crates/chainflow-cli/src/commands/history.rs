//! `chainflow save` / `chainflow history` / `chainflow show` — stored chains
//! and their execution records.

use chainflow_core::store::Persistence;
use chainflow_core::ChainDefinition;

use super::{open_store, print_json};

/// Validate a chain YAML file and store it under its id.
pub async fn save(chain_file: &str, db_path: &str) -> Result<(), String> {
    let chain = ChainDefinition::from_file(chain_file)?;
    chain.validate().map_err(|e| e.to_string())?;

    let store = open_store(db_path)?;
    store.save_chain(&chain).await.map_err(|e| e.to_string())?;
    println!("Saved chain '{}' ({} steps) to {}", chain.id, chain.steps.len(), db_path);
    Ok(())
}

/// List a chain's executions, most recent first.
pub async fn list(chain_id: &str, db_path: &str, limit: usize) -> Result<(), String> {
    let store = open_store(db_path)?;
    let records = store
        .list_executions(chain_id)
        .await
        .map_err(|e| e.to_string())?;

    if records.is_empty() {
        println!("No executions recorded for chain '{}'", chain_id);
        return Ok(());
    }

    println!("┌──────────────────────────────────────┬───────────┬─────────────┬───────┬─────────────────────┐");
    println!("│ Execution                            │ Status    │ Mode        │ Steps │ Started             │");
    println!("├──────────────────────────────────────┼───────────┼─────────────┼───────┼─────────────────────┤");
    for record in records.iter().take(limit) {
        let started = record
            .started_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "│ {:<36} │ {:<9} │ {:<11} │ {:>5} │ {:<19} │",
            record.execution_id,
            record.status.as_str(),
            record.mode.as_str(),
            record.steps.len(),
            started
        );
    }
    println!("└──────────────────────────────────────┴───────────┴─────────────┴───────┴─────────────────────┘");
    Ok(())
}

/// Print one execution record as JSON.
pub async fn show(execution_id: &str, db_path: &str) -> Result<(), String> {
    let store = open_store(db_path)?;
    let record = store
        .get_execution(execution_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("Execution '{}' not found", execution_id))?;
    let value = serde_json::to_value(&record).map_err(|e| e.to_string())?;
    print_json(&value);
    Ok(())
}
