//! Chain definitions.
//!
//! A chain YAML declares an ordered set of agent steps:
//!
//! ```yaml
//! id: "chain-1"
//! name: "Research and answer"
//! mode: conditional        # sequential | parallel | conditional
//!
//! steps:
//!   - agent: { id: "researcher", name: "Research" }
//!     position: 1
//!     knowledge:
//!       refs: ["geography"]
//!
//!   - agent: "answerer"
//!     position: 2
//!     condition: "${Research_result} contains \"Paris\""
//!     input_mapping:
//!       query: "Answer briefly: ${previous_output.content}"
//!       parameters.temperature: 0.2
//!     output_mapping:
//!       final_answer: "${content}"
//!     fallback:
//!       output: "I could not find an answer."
//!     timeout_secs: 60
//! ```

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ChainError;
use crate::knowledge::KnowledgeSpec;

/// How the steps of a chain are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
    Conditional,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Conditional => "conditional",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "sequential" => Some(Self::Sequential),
            "parallel" => Some(Self::Parallel),
            "conditional" => Some(Self::Conditional),
            _ => None,
        }
    }

    /// Incremental delivery needs a single flow with a well-defined last step.
    pub fn supports_streaming(&self) -> bool {
        !matches!(self, Self::Parallel)
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a registered agent: opaque id plus optional display name.
///
/// Accepts either a bare string (`agent: "researcher"`) or a map
/// (`agent: { id: "researcher", name: "Research" }`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "AgentRefRepr")]
pub struct AgentRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AgentRefRepr {
    Id(String),
    Full {
        id: String,
        #[serde(default)]
        name: Option<String>,
    },
}

impl From<AgentRefRepr> for AgentRef {
    fn from(repr: AgentRefRepr) -> Self {
        match repr {
            AgentRefRepr::Id(id) => Self { id, name: None },
            AgentRefRepr::Full { id, name } => Self { id, name },
        }
    }
}

impl AgentRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
        }
    }

    pub fn id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    /// Display name when set, otherwise the id.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Alternate behavior when a step fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FallbackSpec {
    /// Alternate agent invoked with the same input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentRef>,

    /// Literal output used in place of the failed step's output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

/// One step of a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStepSpec {
    pub agent: AgentRef,

    /// 1-based; positions of a chain form a permutation of `1..=N`.
    pub position: u32,

    /// Free-form label, e.g. "processor" or "reviewer".
    #[serde(default = "default_role")]
    pub role: String,

    /// target field → literal or `${path}` source expression.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mapping: BTreeMap<String, Value>,

    /// context key → path into the step's raw output.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_mapping: BTreeMap<String, String>,

    /// Boolean expression; only evaluated in conditional mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge: Option<KnowledgeSpec>,

    /// Overrides the orchestrator's default step timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_role() -> String {
    "processor".to_string()
}

impl AgentStepSpec {
    pub fn new(agent: AgentRef, position: u32) -> Self {
        Self {
            agent,
            position,
            role: default_role(),
            input_mapping: BTreeMap::new(),
            output_mapping: BTreeMap::new(),
            condition: None,
            fallback: None,
            knowledge: None,
            timeout_secs: None,
        }
    }

    pub fn with_input(mut self, target: impl Into<String>, source: impl Into<Value>) -> Self {
        self.input_mapping.insert(target.into(), source.into());
        self
    }

    pub fn with_output(mut self, target: impl Into<String>, source: impl Into<String>) -> Self {
        self.output_mapping.insert(target.into(), source.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackSpec) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_knowledge(mut self, knowledge: KnowledgeSpec) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// A declared chain of agent steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainDefinition {
    pub id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub mode: ExecutionMode,

    #[serde(default)]
    pub steps: Vec<AgentStepSpec>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ChainDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            mode,
            steps: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_step(mut self, step: AgentStepSpec) -> Self {
        self.steps.push(step);
        self
    }

    /// Parse a chain definition from YAML (JSON is valid YAML too).
    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        serde_yaml::from_str(yaml).map_err(|e| format!("Failed to parse chain YAML: {}", e))
    }

    /// Load a chain definition from a file path.
    pub fn from_file(path: &str) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read chain file '{}': {}", path, e))?;
        Self::from_yaml(&content)
    }

    /// Structural checks that must pass before any step runs.
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.id.trim().is_empty() {
            return Err(ChainError::Validation("chain id must not be empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(ChainError::Validation(format!(
                "chain '{}' has no steps",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.position) {
                return Err(ChainError::Validation(format!(
                    "chain '{}' has duplicate step position {}",
                    self.id, step.position
                )));
            }
            if step.agent.id.trim().is_empty() {
                return Err(ChainError::Validation(format!(
                    "step {} of chain '{}' has an empty agent id",
                    step.position, self.id
                )));
            }
            if let Some(fallback) = &step.fallback {
                if fallback.agent.as_ref().is_some_and(|a| a.id.trim().is_empty()) {
                    return Err(ChainError::Validation(format!(
                        "step {} of chain '{}' has a fallback with an empty agent id",
                        step.position, self.id
                    )));
                }
            }
        }

        let n = self.steps.len() as u32;
        if let Some(bad) = self.steps.iter().find(|s| s.position == 0 || s.position > n) {
            return Err(ChainError::Validation(format!(
                "step positions of chain '{}' must be 1..={}, found {}",
                self.id, n, bad.position
            )));
        }
        Ok(())
    }

    /// Steps in position order.
    pub fn ordered_steps(&self) -> Vec<&AgentStepSpec> {
        let mut steps: Vec<&AgentStepSpec> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.position);
        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAIN_YAML: &str = r#"
id: chain-1
name: Research and answer
mode: conditional
steps:
  - agent: { id: researcher, name: Research }
    position: 1
  - agent: answerer
    position: 2
    condition: '${Research_result} contains "Paris"'
    input_mapping:
      query: "${previous_output.content}"
      parameters.temperature: 0.2
    output_mapping:
      final_answer: "${content}"
    fallback:
      output: "no answer"
    timeout_secs: 60
"#;

    #[test]
    fn test_parse_yaml() {
        let chain = ChainDefinition::from_yaml(CHAIN_YAML).unwrap();
        assert_eq!(chain.id, "chain-1");
        assert_eq!(chain.mode, ExecutionMode::Conditional);
        assert_eq!(chain.steps.len(), 2);

        let first = &chain.steps[0];
        assert_eq!(first.agent.label(), "Research");
        assert_eq!(first.role, "processor");

        let second = &chain.steps[1];
        assert_eq!(second.agent, AgentRef::id("answerer"));
        assert_eq!(second.input_mapping["parameters.temperature"], serde_json::json!(0.2));
        assert_eq!(second.output_mapping["final_answer"], "${content}");
        assert_eq!(
            second.fallback.as_ref().and_then(|f| f.output.clone()),
            Some(Value::String("no answer".to_string()))
        );
        assert_eq!(second.timeout_secs, Some(60));
        assert!(chain.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_chain() {
        let chain = ChainDefinition::new("c", "empty", ExecutionMode::Sequential);
        let err = chain.validate().unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn test_validate_rejects_duplicate_and_gapped_positions() {
        let dup = ChainDefinition::new("c", "dup", ExecutionMode::Sequential)
            .with_step(AgentStepSpec::new(AgentRef::id("a"), 1))
            .with_step(AgentStepSpec::new(AgentRef::id("b"), 1));
        assert!(dup.validate().unwrap_err().to_string().contains("duplicate"));

        let gap = ChainDefinition::new("c", "gap", ExecutionMode::Sequential)
            .with_step(AgentStepSpec::new(AgentRef::id("a"), 1))
            .with_step(AgentStepSpec::new(AgentRef::id("b"), 3));
        assert!(gap.validate().is_err());
    }

    #[test]
    fn test_ordered_steps_sorts_by_position() {
        let chain = ChainDefinition::new("c", "order", ExecutionMode::Sequential)
            .with_step(AgentStepSpec::new(AgentRef::id("second"), 2))
            .with_step(AgentStepSpec::new(AgentRef::id("first"), 1));
        let ids: Vec<&str> = chain.ordered_steps().iter().map(|s| s.agent.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);
    }
}
