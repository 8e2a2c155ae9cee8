//! Canonical Message Model
//!
//! Defines the provider-agnostic message format every agent invocation
//! produces and consumes. Wire formats normalize to this type in
//! [`wire`], and [`sse`] renders it as event-stream frames.

pub mod sse;
pub mod wire;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use sse::{to_sse, SseFrame};
pub use wire::{from_wire, from_wire_str, to_wire};

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    /// Parse a role name, accepting the aliases chat-completion providers use.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "system" | "developer" => Some(Self::System),
            "user" | "human" => Some(Self::User),
            "assistant" | "ai" | "model" => Some(Self::Assistant),
            "tool" | "function" => Some(Self::Tool),
            _ => None,
        }
    }
}

/// The closed set of message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    FunctionCall,
    FunctionReturn,
    Thinking,
    Image,
    Voice,
    Code,
    Table,
    Hybrid,
    Status,
    Error,
    Done,
    AnnotatedContext,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::FunctionCall => "function_call",
            Self::FunctionReturn => "function_return",
            Self::Thinking => "thinking",
            Self::Image => "image",
            Self::Voice => "voice",
            Self::Code => "code",
            Self::Table => "table",
            Self::Hybrid => "hybrid",
            Self::Status => "status",
            Self::Error => "error",
            Self::Done => "done",
            Self::AnnotatedContext => "annotated_context",
        }
    }

    /// Done and Error close a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Payloads ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextPayload {
    pub content: String,
    /// True when this is one incremental piece of a longer text.
    #[serde(default)]
    pub is_chunk: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCallPayload {
    /// Correlates the call with its `FunctionReturn`.
    pub call_id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionReturnPayload {
    pub correlation_id: String,
    pub name: String,
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingPayload {
    pub content: String,
    #[serde(default)]
    pub is_chunk: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePayload {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoicePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Base64 audio data, when inlined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TablePayload {
    pub headers: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HybridPayload {
    pub parts: Vec<MessagePayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Fraction of the chain finished, 0.0..=1.0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonePayload {
    pub finish_reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    /// Where the snippet came from (document id, URL, knowledge base ref)
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotatedContextPayload {
    pub content: String,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

/// Kind-specific message body. Serialized with a `kind` tag so the
/// payload fields sit next to the envelope fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePayload {
    Text(TextPayload),
    FunctionCall(FunctionCallPayload),
    FunctionReturn(FunctionReturnPayload),
    Thinking(ThinkingPayload),
    Image(ImagePayload),
    Voice(VoicePayload),
    Code(CodePayload),
    Table(TablePayload),
    Hybrid(HybridPayload),
    Status(StatusPayload),
    Error(ErrorPayload),
    Done(DonePayload),
    AnnotatedContext(AnnotatedContextPayload),
}

impl MessagePayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text(_) => MessageKind::Text,
            Self::FunctionCall(_) => MessageKind::FunctionCall,
            Self::FunctionReturn(_) => MessageKind::FunctionReturn,
            Self::Thinking(_) => MessageKind::Thinking,
            Self::Image(_) => MessageKind::Image,
            Self::Voice(_) => MessageKind::Voice,
            Self::Code(_) => MessageKind::Code,
            Self::Table(_) => MessageKind::Table,
            Self::Hybrid(_) => MessageKind::Hybrid,
            Self::Status(_) => MessageKind::Status,
            Self::Error(_) => MessageKind::Error,
            Self::Done(_) => MessageKind::Done,
            Self::AnnotatedContext(_) => MessageKind::AnnotatedContext,
        }
    }

    /// Best-effort plain-text rendering of the payload.
    pub fn primary_text(&self) -> String {
        match self {
            Self::Text(p) => p.content.clone(),
            Self::Thinking(p) => p.content.clone(),
            Self::Code(p) => p.source.clone(),
            Self::AnnotatedContext(p) => p.content.clone(),
            Self::Error(p) => p.message.clone(),
            Self::Status(p) => p.detail.clone().unwrap_or_else(|| p.stage.clone()),
            Self::FunctionReturn(p) => match &p.result {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            Self::Voice(p) => p.transcript.clone().unwrap_or_default(),
            Self::Table(p) => render_table(p),
            Self::Hybrid(p) => p
                .parts
                .iter()
                .map(|part| part.primary_text())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
            Self::FunctionCall(_) | Self::Image(_) | Self::Done(_) => String::new(),
        }
    }
}

/// Render a table payload as a markdown table.
pub fn render_table(table: &TablePayload) -> String {
    let mut out = String::new();
    out.push_str(&format!("| {} |\n", table.headers.join(" | ")));
    out.push_str(&format!(
        "|{}|\n",
        table.headers.iter().map(|_| "---").collect::<Vec<_>>().join("|")
    ));
    for row in &table.rows {
        let cells: Vec<String> = row
            .iter()
            .map(|cell| match cell {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        out.push_str(&format!("| {} |\n", cells.join(" | ")));
    }
    out
}

// ─── Canonical Message ────────────────────────────────────────────────────

/// A single message in the canonical model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalMessage {
    pub id: String,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(flatten)]
    pub payload: MessagePayload,
}

impl CanonicalMessage {
    pub fn new(role: Role, payload: MessagePayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            timestamp: Utc::now(),
            metadata: Map::new(),
            payload,
        }
    }

    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self::new(
            role,
            MessagePayload::Text(TextPayload {
                content: content.into(),
                is_chunk: false,
            }),
        )
    }

    /// One incremental piece of assistant text.
    pub fn chunk(content: impl Into<String>) -> Self {
        Self::new(
            Role::Assistant,
            MessagePayload::Text(TextPayload {
                content: content.into(),
                is_chunk: true,
            }),
        )
    }

    pub fn thinking(content: impl Into<String>, is_chunk: bool) -> Self {
        Self::new(
            Role::Assistant,
            MessagePayload::Thinking(ThinkingPayload {
                content: content.into(),
                is_chunk,
            }),
        )
    }

    pub fn function_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: Value,
    ) -> Self {
        Self::new(
            Role::Assistant,
            MessagePayload::FunctionCall(FunctionCallPayload {
                call_id: call_id.into(),
                name: name.into(),
                arguments,
            }),
        )
    }

    pub fn function_return(
        correlation_id: impl Into<String>,
        name: impl Into<String>,
        result: Value,
    ) -> Self {
        Self::new(
            Role::Tool,
            MessagePayload::FunctionReturn(FunctionReturnPayload {
                correlation_id: correlation_id.into(),
                name: name.into(),
                result,
            }),
        )
    }

    pub fn status(stage: impl Into<String>, detail: Option<String>, progress: Option<f64>) -> Self {
        Self::new(
            Role::System,
            MessagePayload::Status(StatusPayload {
                stage: stage.into(),
                detail,
                progress,
            }),
        )
    }

    pub fn error(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new(
            Role::System,
            MessagePayload::Error(ErrorPayload {
                message: message.into(),
                code: code.into(),
            }),
        )
    }

    pub fn done(finish_reason: impl Into<String>) -> Self {
        Self::new(
            Role::System,
            MessagePayload::Done(DonePayload {
                finish_reason: finish_reason.into(),
            }),
        )
    }

    /// Attach a metadata entry (builder style).
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }

    /// True for incremental text or thinking pieces.
    pub fn is_chunk(&self) -> bool {
        match &self.payload {
            MessagePayload::Text(p) => p.is_chunk,
            MessagePayload::Thinking(p) => p.is_chunk,
            _ => false,
        }
    }

    pub fn primary_text(&self) -> String {
        self.payload.primary_text()
    }

    /// True when the wire adapter had to degrade this message.
    pub fn is_degraded(&self) -> bool {
        self.metadata
            .get("degraded")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}
