use serde_json::{Map, Value};

use super::path::{Path, PathError};

/// Key/value scratch space threaded through one execution.
///
/// Seeded once from the caller's initial context; every completed step adds
/// `step_<position>_result` and, when the step has a display name,
/// `<name>_result`.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    entries: Map<String, Value>,
    input: String,
}

impl ExecutionContext {
    pub fn new(input: impl Into<String>, seed: Map<String, Value>) -> Self {
        Self {
            entries: seed,
            input: input.into(),
        }
    }

    /// The chain's initial input.
    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    /// Set a possibly nested key (`summary.short`).
    pub fn set_path(&mut self, target: &str, value: Value) -> Result<(), PathError> {
        let path = Path::parse(target)?;
        let mut root = Value::Object(std::mem::take(&mut self.entries));
        let result = path.set(&mut root, value);
        if let Value::Object(map) = root {
            self.entries = map;
        }
        result
    }

    pub fn entries(&self) -> &Map<String, Value> {
        &self.entries
    }

    pub fn into_entries(self) -> Map<String, Value> {
        self.entries
    }

    /// Record a step's primary output under its position and display name.
    pub fn record_step_output(&mut self, position: u32, agent_name: Option<&str>, content: &str) {
        let value = Value::String(content.to_string());
        self.entries
            .insert(format!("step_{}_result", position), value.clone());
        if let Some(name) = agent_name.filter(|n| !n.trim().is_empty()) {
            self.entries.insert(format!("{}_result", name), value);
        }
    }

    /// The tree mapping paths and conditions resolve against: every context
    /// entry at top level, plus `context`, `previous_output` and `input`.
    pub fn tree(&self, previous_output: Option<Value>) -> Value {
        let mut root = self.entries.clone();
        root.insert("context".to_string(), Value::Object(self.entries.clone()));
        root.insert(
            "previous_output".to_string(),
            previous_output.unwrap_or(Value::Null),
        );
        root.insert("input".to_string(), Value::String(self.input.clone()));
        Value::Object(root)
    }
}
