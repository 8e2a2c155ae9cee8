//! Wire Adapter — canonical messages ⇄ chat-completion JSON.
//!
//! The wire side is caller-controlled, so the decoding direction never
//! fails: content it cannot type collapses to a Text message with a
//! descriptive placeholder, and input that has neither a role nor any
//! content becomes an empty assistant Text flagged `"degraded": true`.

use serde_json::{json, Map, Value};

use super::{
    render_table, CanonicalMessage, CodePayload, FunctionCallPayload, FunctionReturnPayload,
    HybridPayload, ImagePayload, MessageKind, MessagePayload, Role, TextPayload, ThinkingPayload,
    VoicePayload,
};

// ─── Canonical → Wire ─────────────────────────────────────────────────────

/// Convert a canonical message into a chat-completion message object.
pub fn to_wire(msg: &CanonicalMessage) -> Value {
    let role = msg.role.as_str();
    match &msg.payload {
        MessagePayload::Text(p) => json!({ "role": role, "content": p.content }),
        MessagePayload::Thinking(p) => json!({
            "role": Role::Assistant.as_str(),
            "content": "",
            "reasoning_content": p.content,
        }),
        MessagePayload::FunctionCall(p) => json!({
            "role": Role::Assistant.as_str(),
            "content": Value::Null,
            "tool_calls": [tool_call_to_wire(p)],
        }),
        MessagePayload::FunctionReturn(p) => json!({
            "role": Role::Tool.as_str(),
            "tool_call_id": p.correlation_id,
            "name": p.name,
            "content": value_to_text(&p.result),
        }),
        MessagePayload::Image(p) => json!({ "role": role, "content": [image_part(p)] }),
        MessagePayload::Voice(p) => json!({ "role": role, "content": [voice_part(p)] }),
        MessagePayload::Hybrid(p) => hybrid_to_wire(role, p),
        MessagePayload::Code(p) => json!({ "role": role, "content": code_to_text(p) }),
        MessagePayload::Table(p) => json!({ "role": role, "content": render_table(p) }),
        MessagePayload::AnnotatedContext(p) => {
            let mut content = p.content.clone();
            if !p.annotations.is_empty() {
                content.push_str("\n\nSources:\n");
                for a in &p.annotations {
                    content.push_str(&format!("- {}\n", a.source));
                }
            }
            json!({ "role": role, "content": content })
        }
        MessagePayload::Status(p) => json!({
            "role": role,
            "content": match &p.detail {
                Some(detail) => format!("[status] {}: {}", p.stage, detail),
                None => format!("[status] {}", p.stage),
            },
        }),
        MessagePayload::Error(p) => json!({
            "role": role,
            "content": format!("[error:{}] {}", p.code, p.message),
        }),
        MessagePayload::Done(_) => json!({ "role": role, "content": "" }),
    }
}

/// Render a conversation for a request body. Stream-control messages
/// (Status, Error, Done) are not part of a conversation and are dropped.
pub fn to_wire_messages(messages: &[CanonicalMessage]) -> Value {
    Value::Array(
        messages
            .iter()
            .filter(|m| {
                !matches!(
                    m.kind(),
                    MessageKind::Status | MessageKind::Error | MessageKind::Done
                )
            })
            .map(to_wire)
            .collect(),
    )
}

fn tool_call_to_wire(p: &FunctionCallPayload) -> Value {
    let arguments = match &p.arguments {
        Value::String(s) => s.clone(),
        Value::Null => "{}".to_string(),
        other => other.to_string(),
    };
    json!({
        "id": p.call_id,
        "type": "function",
        "function": { "name": p.name, "arguments": arguments },
    })
}

fn image_part(p: &ImagePayload) -> Value {
    json!({ "type": "image_url", "image_url": { "url": p.url } })
}

fn voice_part(p: &VoicePayload) -> Value {
    match &p.data {
        Some(data) => json!({
            "type": "input_audio",
            "input_audio": { "data": data, "format": p.format.clone().unwrap_or_else(|| "wav".to_string()) },
        }),
        None => json!({
            "type": "text",
            "text": p.transcript.clone().unwrap_or_else(|| "[audio message]".to_string()),
        }),
    }
}

fn code_to_text(p: &CodePayload) -> String {
    format!(
        "```{}\n{}\n```",
        p.language.as_deref().unwrap_or(""),
        p.source
    )
}

fn hybrid_to_wire(role: &str, p: &HybridPayload) -> Value {
    let mut content_parts = Vec::new();
    let mut tool_calls = Vec::new();

    for part in &p.parts {
        match part {
            MessagePayload::FunctionCall(call) => tool_calls.push(tool_call_to_wire(call)),
            MessagePayload::Image(img) => content_parts.push(image_part(img)),
            MessagePayload::Voice(voice) => content_parts.push(voice_part(voice)),
            MessagePayload::Code(code) => {
                content_parts.push(json!({ "type": "text", "text": code_to_text(code) }))
            }
            other => {
                let text = other.primary_text();
                if !text.is_empty() {
                    content_parts.push(json!({ "type": "text", "text": text }));
                }
            }
        }
    }

    if tool_calls.is_empty() {
        return json!({ "role": role, "content": content_parts });
    }

    // Tool calls only travel on assistant messages; text rides along as a string.
    let text: Vec<String> = content_parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()).map(str::to_string))
        .collect();
    json!({
        "role": Role::Assistant.as_str(),
        "content": if text.is_empty() { Value::Null } else { Value::String(text.join("\n")) },
        "tool_calls": tool_calls,
    })
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ─── Wire → Canonical ─────────────────────────────────────────────────────

/// Convert a chat-completion message object into a canonical message.
/// Never fails; see the module docs for the degradation rules.
pub fn from_wire(value: &Value) -> CanonicalMessage {
    let Some(obj) = value.as_object() else {
        return degraded("wire message is not a JSON object");
    };

    let raw_role = obj.get("role").and_then(|r| r.as_str());
    let role = raw_role.and_then(Role::from_str);
    let content = obj.get("content").filter(|c| !c.is_null());
    let tool_calls = obj
        .get("tool_calls")
        .and_then(|t| t.as_array())
        .filter(|calls| !calls.is_empty());
    let reasoning = obj
        .get("reasoning_content")
        .and_then(|r| r.as_str())
        .filter(|r| !r.is_empty());

    if raw_role.is_none() && content.is_none() && tool_calls.is_none() && reasoning.is_none() {
        return degraded("wire message has neither role nor content");
    }

    let resolved_role = role.unwrap_or(Role::Assistant);
    let mut msg = typed_from_wire(obj, resolved_role, content, tool_calls, reasoning);

    if role.is_none() {
        if let Some(original) = raw_role {
            msg.metadata
                .insert("originalRole".to_string(), Value::String(original.to_string()));
        }
    }
    if let Some(name) = obj.get("name").and_then(|n| n.as_str()) {
        if msg.kind() != MessageKind::FunctionReturn {
            msg.metadata
                .insert("name".to_string(), Value::String(name.to_string()));
        }
    }
    msg
}

/// Parse a wire message from JSON text. Unparsable text degrades.
pub fn from_wire_str(text: &str) -> CanonicalMessage {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => from_wire(&value),
        Err(e) => {
            tracing::warn!("[WireAdapter] Unparsable wire message: {}", e);
            degraded("wire message is not valid JSON")
        }
    }
}

fn typed_from_wire(
    obj: &Map<String, Value>,
    role: Role,
    content: Option<&Value>,
    tool_calls: Option<&Vec<Value>>,
    reasoning: Option<&str>,
) -> CanonicalMessage {
    // Tool results
    if let Some(correlation_id) = obj.get("tool_call_id").and_then(|id| id.as_str()) {
        let name = obj
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or_default();
        let result = content.map(parse_tool_result).unwrap_or(Value::Null);
        return CanonicalMessage::new(
            Role::Tool,
            MessagePayload::FunctionReturn(FunctionReturnPayload {
                correlation_id: correlation_id.to_string(),
                name: name.to_string(),
                result,
            }),
        );
    }

    // Tool calls (possibly alongside text)
    if let Some(calls) = tool_calls {
        let mut parts: Vec<MessagePayload> = calls
            .iter()
            .filter_map(parse_tool_call)
            .map(MessagePayload::FunctionCall)
            .collect();
        let text = content.map(content_text).unwrap_or_default();

        if parts.len() == 1 && text.is_empty() {
            if let Some(part) = parts.pop() {
                return CanonicalMessage::new(role, part);
            }
        }
        if !parts.is_empty() {
            if !text.is_empty() {
                parts.insert(0, text_payload(text));
            }
            return CanonicalMessage::new(role, MessagePayload::Hybrid(HybridPayload { parts }));
        }
    }

    match content {
        Some(Value::String(s)) => {
            if s.is_empty() {
                if let Some(r) = reasoning {
                    return CanonicalMessage::new(role, thinking_payload(r));
                }
            }
            CanonicalMessage::new(role, text_payload(s.clone()))
        }
        Some(Value::Array(parts)) => from_content_parts(role, parts),
        Some(_) => placeholder(role, "[unsupported content]", "content"),
        None => match reasoning {
            Some(r) => CanonicalMessage::new(role, thinking_payload(r)),
            None => CanonicalMessage::new(role, text_payload(String::new())),
        },
    }
}

fn from_content_parts(role: Role, parts: &[Value]) -> CanonicalMessage {
    let mut payloads = Vec::new();
    let mut unsupported = Vec::new();

    for part in parts {
        let part_type = part.get("type").and_then(|t| t.as_str()).unwrap_or("");
        match part_type {
            "text" | "input_text" | "output_text" => {
                let text = part.get("text").and_then(|t| t.as_str()).unwrap_or_default();
                payloads.push(text_payload(text.to_string()));
            }
            "refusal" => {
                let text = part
                    .get("refusal")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default();
                payloads.push(text_payload(text.to_string()));
            }
            "image_url" => {
                let url = part
                    .get("image_url")
                    .and_then(|i| i.get("url").or(Some(i)))
                    .and_then(|u| u.as_str());
                match url {
                    Some(url) => payloads.push(MessagePayload::Image(ImagePayload {
                        url: url.to_string(),
                        mime_type: None,
                        alt: None,
                    })),
                    None => {
                        unsupported.push("image".to_string());
                        payloads.push(text_payload("[image message]".to_string()));
                    }
                }
            }
            "input_audio" => {
                let audio = part.get("input_audio");
                payloads.push(MessagePayload::Voice(VoicePayload {
                    url: None,
                    data: audio
                        .and_then(|a| a.get("data"))
                        .and_then(|d| d.as_str())
                        .map(str::to_string),
                    format: audio
                        .and_then(|a| a.get("format"))
                        .and_then(|f| f.as_str())
                        .map(str::to_string),
                    transcript: None,
                }));
            }
            other => {
                let label = placeholder_label(other);
                unsupported.push(label.clone());
                payloads.push(text_payload(format!("[{} message]", label)));
            }
        }
    }

    let mut msg = if payloads.is_empty() {
        CanonicalMessage::new(role, text_payload(String::new()))
    } else if payloads.iter().all(|p| matches!(p, MessagePayload::Text(_))) {
        let joined = payloads
            .iter()
            .map(|p| p.primary_text())
            .collect::<Vec<_>>()
            .join("\n");
        CanonicalMessage::new(role, text_payload(joined))
    } else if payloads.len() == 1 {
        let only = payloads.remove(0);
        CanonicalMessage::new(role, only)
    } else {
        CanonicalMessage::new(role, MessagePayload::Hybrid(HybridPayload { parts: payloads }))
    };

    if !unsupported.is_empty() {
        msg.metadata.insert(
            "unsupported".to_string(),
            Value::Array(unsupported.into_iter().map(Value::String).collect()),
        );
    }
    msg
}

/// "image" → "image", "input_file" → "file", "" → "unsupported".
fn placeholder_label(part_type: &str) -> String {
    let trimmed = part_type
        .trim_start_matches("input_")
        .trim_start_matches("output_")
        .trim_end_matches("_url");
    if trimmed.is_empty() {
        "unsupported".to_string()
    } else {
        trimmed.to_string()
    }
}

fn parse_tool_call(call: &Value) -> Option<FunctionCallPayload> {
    let function = call.get("function")?;
    let name = function.get("name").and_then(|n| n.as_str())?;
    let call_id = call
        .get("id")
        .and_then(|id| id.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
    let arguments = match function.get("arguments") {
        Some(Value::String(s)) => {
            serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone()))
        }
        Some(other) => other.clone(),
        None => Value::Object(Map::new()),
    };
    Some(FunctionCallPayload {
        call_id,
        name: name.to_string(),
        arguments,
    })
}

fn parse_tool_result(content: &Value) -> Value {
    match content {
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone())),
        Value::Array(_) => Value::String(content_text(content)),
        other => other.clone(),
    }
}

fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn text_payload(content: String) -> MessagePayload {
    MessagePayload::Text(TextPayload {
        content,
        is_chunk: false,
    })
}

fn thinking_payload(content: &str) -> MessagePayload {
    MessagePayload::Thinking(ThinkingPayload {
        content: content.to_string(),
        is_chunk: false,
    })
}

fn placeholder(role: Role, text: &str, what: &str) -> CanonicalMessage {
    CanonicalMessage::new(role, text_payload(text.to_string()))
        .with_metadata("unsupported", Value::Array(vec![Value::String(what.to_string())]))
}

fn degraded(reason: &str) -> CanonicalMessage {
    CanonicalMessage::text(Role::Assistant, "")
        .with_metadata("degraded", true)
        .with_metadata("degradedReason", reason)
}

// ─── Completion responses ─────────────────────────────────────────────────

/// Extract the messages of a (non-streaming) chat-completion response.
pub fn from_completion_response(body: &Value) -> Vec<CanonicalMessage> {
    let choices = body.get("choices").and_then(|c| c.as_array());
    match choices {
        Some(choices) if !choices.is_empty() => choices
            .iter()
            .map(|choice| match choice.get("message") {
                Some(message) => from_wire(message),
                None => degraded("completion choice has no message"),
            })
            .collect(),
        _ => vec![degraded("completion response has no choices")],
    }
}

/// Extract incremental messages from one streaming completion chunk.
/// Only text and reasoning deltas are surfaced; tool-call deltas are
/// assembled by the provider adapter, not here.
pub fn from_completion_chunk(chunk: &Value) -> Vec<CanonicalMessage> {
    let Some(delta) = chunk
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("delta"))
    else {
        return Vec::new();
    };

    let mut out = Vec::new();
    if let Some(reasoning) = delta
        .get("reasoning_content")
        .and_then(|r| r.as_str())
        .filter(|r| !r.is_empty())
    {
        out.push(CanonicalMessage::thinking(reasoning, true));
    }
    if let Some(content) = delta
        .get("content")
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty())
    {
        out.push(CanonicalMessage::chunk(content));
    }
    out
}
