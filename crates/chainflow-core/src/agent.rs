//! Agent Capability — the one contract an agent backend satisfies.
//!
//! Concrete backends (chat-completion HTTP, retrieval, tools) live at the
//! boundary and are registered by id in an [`AgentRegistry`] that the
//! orchestrator receives at construction.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::message::CanonicalMessage;
use crate::models::AgentRef;
use crate::stream::{ChunkSink, StreamError};

// ─── Input / Output ───────────────────────────────────────────────────────

/// What an agent receives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalInput {
    /// The primary instruction text.
    pub query: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl CanonicalInput {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Token accounting reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// What an agent produces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalOutput {
    /// Primary textual output; this is what flows forward by default.
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<CanonicalMessage>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl CanonicalOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    /// Output substituted by a literal fallback payload.
    pub fn from_fallback(payload: &Value) -> Self {
        let content = match payload {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        let mut out = Self::text(content);
        out.metadata.insert("fallback".to_string(), Value::Bool(true));
        out.metadata.insert("payload".to_string(), payload.clone());
        out
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_message(mut self, msg: CanonicalMessage) -> Self {
        self.messages.push(msg);
        self
    }

    /// The raw output tree output-mapping paths resolve against.
    pub fn to_value(&self) -> Value {
        json!({
            "content": self.content,
            "messages": serde_json::to_value(&self.messages).unwrap_or(Value::Array(Vec::new())),
            "metadata": self.metadata,
            "usage": self.usage,
        })
    }
}

// ─── Errors ───────────────────────────────────────────────────────────────

/// Failure reported by (or on behalf of) an agent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct AgentError {
    pub message: String,
    pub code: String,
}

impl AgentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: "agent_error".to_string(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn timeout(secs: u64) -> Self {
        Self::new(format!("agent did not respond within {}s", secs)).with_code("timeout")
    }

    pub fn cancelled() -> Self {
        Self::new("execution cancelled").with_code("cancelled")
    }

    /// Cancelled by the caller, or the stream it was writing to is gone.
    pub fn is_cancelled(&self) -> bool {
        self.code == "cancelled" || self.code == "stream_closed"
    }
}

impl From<StreamError> for AgentError {
    fn from(e: StreamError) -> Self {
        let code = match &e {
            StreamError::Closed | StreamError::Disconnected => "stream_closed",
            StreamError::ReservedKind(_) => "stream_protocol_error",
        };
        Self::new(e.to_string()).with_code(code)
    }
}

// ─── Capability ───────────────────────────────────────────────────────────

#[async_trait]
pub trait AgentCapability: Send + Sync {
    async fn invoke(&self, input: CanonicalInput) -> Result<CanonicalOutput, AgentError>;

    /// Invoke while delivering output incrementally through `sink`.
    ///
    /// The default runs [`invoke`](Self::invoke) and emits the whole
    /// content as a single chunk.
    async fn invoke_stream(
        &self,
        input: CanonicalInput,
        sink: &ChunkSink<'_>,
    ) -> Result<CanonicalOutput, AgentError> {
        let output = self.invoke(input).await?;
        sink.text(output.content.clone()).await?;
        Ok(output)
    }
}

// ─── Registry ─────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RegisteredAgent {
    pub id: String,
    pub name: String,
    pub agent: Arc<dyn AgentCapability>,
}

impl std::fmt::Debug for RegisteredAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredAgent")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Agents available to an orchestrator, by id and by display name.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, RegisteredAgent>,
    by_name: HashMap<String, String>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an agent.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        agent: Arc<dyn AgentCapability>,
    ) {
        let id = id.into();
        let name = name.into();
        if let Some(previous) = self.agents.get(&id) {
            tracing::debug!("[AgentRegistry] Replacing agent {}", id);
            self.by_name.remove(&previous.name);
        }
        self.by_name.insert(name.clone(), id.clone());
        self.agents.insert(
            id.clone(),
            RegisteredAgent {
                id,
                name,
                agent,
            },
        );
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(
        mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        agent: Arc<dyn AgentCapability>,
    ) -> Self {
        self.register(id, name, agent);
        self
    }

    pub fn get(&self, id: &str) -> Option<&RegisteredAgent> {
        self.agents.get(id)
    }

    /// Resolve a step's agent reference: by id first, then by display name.
    pub fn resolve(&self, agent_ref: &AgentRef) -> Option<&RegisteredAgent> {
        self.agents.get(&agent_ref.id).or_else(|| {
            self.by_name
                .get(&agent_ref.id)
                .or_else(|| agent_ref.name.as_ref().and_then(|n| self.by_name.get(n)))
                .and_then(|id| self.agents.get(id))
        })
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
