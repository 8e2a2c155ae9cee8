//! Agent backends for the CLI, loaded from an agents YAML file.
//!
//! ```yaml
//! agents:
//!   - id: researcher
//!     name: Research
//!     kind: chat_completion
//!     base_url: "${OPENAI_BASE_URL:-https://api.openai.com/v1}"
//!     api_key: "${OPENAI_API_KEY}"
//!     model: gpt-4o-mini
//!     system_prompt: "You research facts."
//!     temperature: 0.2
//!
//!   - id: answerer
//!     name: Answer
//!     kind: echo
//!     prefix: "Answer: "
//! ```

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chainflow_core::message::wire;
use chainflow_core::{
    AgentCapability, AgentError, AgentRegistry, CanonicalInput, CanonicalMessage, CanonicalOutput,
    ChunkSink, MessagePayload, Role, Usage,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::StreamExt;

static ENV_REFERENCE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex"));

/// Resolve environment variable references in a string.
/// Supports `${ENV_VAR}` and `${ENV_VAR:-default}` syntax.
pub fn resolve_env_vars(input: &str) -> String {
    ENV_REFERENCE
        .replace_all(input, |caps: &regex::Captures| {
            let var_expr = &caps[1];
            if let Some(idx) = var_expr.find(":-") {
                let var_name = &var_expr[..idx];
                let default_val = &var_expr[idx + 2..];
                std::env::var(var_name).unwrap_or_else(|_| default_val.to_string())
            } else {
                std::env::var(var_expr).unwrap_or_else(|_| format!("${{{}}}", var_expr))
            }
        })
        .to_string()
}

// ─── Agents file ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    #[default]
    ChatCompletion,
    Echo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub kind: AgentKind,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub system_prompt: String,

    #[serde(default)]
    pub temperature: Option<f64>,

    /// Request timeout for chat-completion calls.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Echo agents only.
    #[serde(default)]
    pub prefix: String,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentsFile {
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

impl AgentsFile {
    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        let mut file: Self = serde_yaml::from_str(yaml)
            .map_err(|e| format!("Failed to parse agents YAML: {}", e))?;
        for agent in &mut file.agents {
            agent.base_url = resolve_env_vars(&agent.base_url);
            agent.api_key = resolve_env_vars(&agent.api_key);
            agent.model = resolve_env_vars(&agent.model);
        }
        Ok(file)
    }

    pub fn from_file(path: &str) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read agents file '{}': {}", path, e))?;
        Self::from_yaml(&content)
    }

    pub fn into_registry(self) -> Result<AgentRegistry, String> {
        let mut registry = AgentRegistry::new();
        for config in self.agents {
            if config.id.trim().is_empty() {
                return Err("agent entry with an empty id".to_string());
            }
            let name = config.name.clone().unwrap_or_else(|| config.id.clone());
            let agent: Arc<dyn AgentCapability> = match config.kind {
                AgentKind::Echo => Arc::new(EchoAgent::new(config.prefix.clone())),
                AgentKind::ChatCompletion => {
                    if config.model.is_empty() {
                        return Err(format!("agent '{}' has no model", config.id));
                    }
                    Arc::new(ChatCompletionAgent::new(config.clone()))
                }
            };
            tracing::info!(
                "[Agents] Registered {} ({:?})",
                config.id,
                config.kind
            );
            registry.register(config.id, name, agent);
        }
        Ok(registry)
    }
}

// ─── Echo ─────────────────────────────────────────────────────────────────

/// Repeats its query back. Used for dry runs of a chain's data flow.
pub struct EchoAgent {
    prefix: String,
}

impl EchoAgent {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl AgentCapability for EchoAgent {
    async fn invoke(&self, input: CanonicalInput) -> Result<CanonicalOutput, AgentError> {
        Ok(CanonicalOutput::text(format!("{}{}", self.prefix, input.query)))
    }

    async fn invoke_stream(
        &self,
        input: CanonicalInput,
        sink: &ChunkSink<'_>,
    ) -> Result<CanonicalOutput, AgentError> {
        let content = format!("{}{}", self.prefix, input.query);
        for piece in content.split_inclusive(' ') {
            sink.text(piece).await?;
        }
        Ok(CanonicalOutput::text(content))
    }
}

// ─── Chat completion ──────────────────────────────────────────────────────

/// OpenAI-compatible `POST {base_url}/chat/completions` backend.
pub struct ChatCompletionAgent {
    config: AgentConfig,
    client: reqwest::Client,
}

impl ChatCompletionAgent {
    pub fn new(config: AgentConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, client }
    }

    fn url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    /// Request body: optional system prompt, then the query as a user turn.
    /// `temperature` and `max_tokens` in the step parameters override the
    /// agent's defaults.
    fn request_body(&self, input: &CanonicalInput, stream: bool) -> Value {
        let mut messages = Vec::new();
        if !self.config.system_prompt.is_empty() {
            messages.push(CanonicalMessage::text(
                Role::System,
                self.config.system_prompt.clone(),
            ));
        }
        messages.push(CanonicalMessage::text(Role::User, input.query.clone()));

        let mut body = json!({
            "model": self.config.model,
            "messages": wire::to_wire_messages(&messages),
        });
        let temperature = input
            .parameters
            .get("temperature")
            .and_then(Value::as_f64)
            .or(self.config.temperature);
        if let Some(temp) = temperature {
            body["temperature"] = json!(temp);
        }
        if let Some(max_tokens) = input.parameters.get("max_tokens").and_then(Value::as_u64) {
            body["max_tokens"] = json!(max_tokens);
        }
        if stream {
            body["stream"] = Value::Bool(true);
            body["stream_options"] = json!({ "include_usage": true });
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, AgentError> {
        tracing::info!(
            "[ChatCompletion] Calling {} (model: {})",
            self.url(),
            self.config.model
        );
        let response = self
            .client
            .post(self.url())
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                let code = if e.is_timeout() { "timeout" } else { "http_error" };
                AgentError::new(format!("HTTP request failed: {}", e)).with_code(code)
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(
                AgentError::new(format!("API returned {}: {}", status, text)).with_code("upstream_error"),
            );
        }
        Ok(response)
    }
}

/// Token usage from an OpenAI-style `usage` object.
fn parse_usage(body: &Value) -> Option<Usage> {
    let usage = body.get("usage").filter(|u| u.is_object())?;
    let field = |primary: &str, alt: &str| {
        usage
            .get(primary)
            .or_else(|| usage.get(alt))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    Some(Usage::new(
        field("prompt_tokens", "input_tokens"),
        field("completion_tokens", "output_tokens"),
    ))
}

/// Payload of one SSE `data:` line; `None` for anything else.
fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// Splits a response body into lines. Bytes are held until a full line has
/// arrived, so a character split across network chunks decodes intact.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<String> {
        let newline = self.pending.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=newline).collect();
        Some(String::from_utf8_lossy(&line).trim_end().to_string())
    }
}

#[async_trait]
impl AgentCapability for ChatCompletionAgent {
    async fn invoke(&self, input: CanonicalInput) -> Result<CanonicalOutput, AgentError> {
        let response = self.send(&self.request_body(&input, false)).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| AgentError::new(format!("Failed to parse response JSON: {}", e)))?;

        let messages = wire::from_completion_response(&body);
        let content = messages
            .iter()
            .find(|m| !m.is_degraded())
            .map(|m| m.primary_text())
            .unwrap_or_default();

        let mut output = CanonicalOutput::text(content);
        if let Some(model) = body.get("model").and_then(Value::as_str) {
            output = output.with_metadata("model", model);
        }
        if let Some(usage) = parse_usage(&body) {
            output = output.with_usage(usage);
        }
        output.messages = messages;
        Ok(output)
    }

    async fn invoke_stream(
        &self,
        input: CanonicalInput,
        sink: &ChunkSink<'_>,
    ) -> Result<CanonicalOutput, AgentError> {
        let response = self.send(&self.request_body(&input, true)).await?;
        let stream = response.bytes_stream();
        tokio::pin!(stream);

        let mut lines = LineBuffer::default();
        let mut content = String::new();
        let mut usage = None;

        'read: while let Some(bytes) = stream.next().await {
            let bytes = bytes.map_err(|e| {
                AgentError::new(format!("Stream read failed: {}", e)).with_code("http_error")
            })?;
            lines.push(&bytes);

            while let Some(line) = lines.next_line() {
                let Some(data) = sse_data(&line) else {
                    continue;
                };
                if data == "[DONE]" {
                    break 'read;
                }
                let chunk: Value = match serde_json::from_str(data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::warn!("[ChatCompletion] Skipping unparsable chunk: {}", e);
                        continue;
                    }
                };
                if let Some(u) = parse_usage(&chunk) {
                    usage = Some(u);
                }
                for msg in wire::from_completion_chunk(&chunk) {
                    match msg.payload {
                        MessagePayload::Thinking(p) => sink.thinking(p.content).await?,
                        MessagePayload::Text(p) => {
                            content.push_str(&p.content);
                            sink.text(p.content).await?;
                        }
                        _ => {}
                    }
                }
            }
        }

        let mut output = CanonicalOutput::text(content);
        if let Some(usage) = usage {
            output = output.with_usage(usage);
        }
        Ok(output)
    }
}
