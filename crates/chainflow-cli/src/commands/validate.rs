//! `chainflow validate` — check a chain YAML file without executing it.

use chainflow_core::condition::Condition;
use chainflow_core::{AgentRegistry, ChainDefinition, ExecutionMode};

use crate::agents::AgentsFile;

pub async fn validate(chain_file: &str, agents_file: Option<&str>) -> Result<(), String> {
    let chain = ChainDefinition::from_file(chain_file)?;
    let registry = match agents_file {
        Some(path) => Some(AgentsFile::from_file(path)?.into_registry()?),
        None => None,
    };
    let problems = check(&chain, registry.as_ref());
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("  ✗ {}", problem);
        }
        return Err(format!(
            "Chain '{}' is invalid ({} problem(s))",
            chain.id,
            problems.len()
        ));
    }

    println!("✅ Chain '{}' is valid", chain.id);
    println!("   Name: {}", chain.name);
    println!("   Mode: {}", chain.mode);
    println!("   Steps: {}", chain.steps.len());
    for step in chain.ordered_steps() {
        let mut extras = Vec::new();
        if let Some(condition) = &step.condition {
            extras.push(format!("if {}", condition));
        }
        if step.fallback.is_some() {
            extras.push("fallback".to_string());
        }
        if step.knowledge.is_some() {
            extras.push("knowledge".to_string());
        }
        println!(
            "   {}. {} ({}){}",
            step.position,
            step.agent.label(),
            step.role,
            if extras.is_empty() {
                String::new()
            } else {
                format!(" [{}]", extras.join(", "))
            }
        );
    }
    Ok(())
}

/// Everything wrong with a chain: structural validation, unparsable
/// conditions and, when a registry is given, unknown agents.
pub fn check(chain: &ChainDefinition, registry: Option<&AgentRegistry>) -> Vec<String> {
    let mut problems = Vec::new();
    if let Err(e) = chain.validate() {
        problems.push(e.to_string());
    }

    for step in &chain.steps {
        if let Some(condition) = &step.condition {
            if let Err(e) = Condition::parse(condition) {
                problems.push(format!("step {}: condition '{}': {}", step.position, condition, e));
            } else if chain.mode != ExecutionMode::Conditional {
                tracing::warn!(
                    "[CLI] Step {} has a condition but chain '{}' runs in {} mode",
                    step.position,
                    chain.id,
                    chain.mode
                );
            }
        }

        let Some(registry) = registry else {
            continue;
        };
        if registry.resolve(&step.agent).is_none() {
            problems.push(format!(
                "step {}: unknown agent '{}'",
                step.position, step.agent.id
            ));
        }
        if let Some(fallback) = step.fallback.as_ref().and_then(|f| f.agent.as_ref()) {
            if registry.resolve(fallback).is_none() {
                problems.push(format!(
                    "step {}: unknown fallback agent '{}'",
                    step.position, fallback.id
                ));
            }
        }
    }
    problems
}
