//! Server-Sent Events framing for canonical messages.
//!
//! Each message becomes one frame: the event name is the message kind and
//! the data line is the message's JSON serialization.

use super::CanonicalMessage;

/// One SSE frame, ready to be written to a response body.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

impl SseFrame {
    /// Render as `event: <kind>\ndata: <json>\n\n`.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.event.len() + self.data.len() + 16);
        out.push_str("event: ");
        out.push_str(&self.event);
        out.push('\n');
        // A data payload spanning lines must repeat the field name per line.
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

impl std::fmt::Display for SseFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// Convert a canonical message into an SSE frame.
pub fn to_sse(msg: &CanonicalMessage) -> SseFrame {
    let data = match serde_json::to_string(msg) {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!("[Sse] Failed to serialize message {}: {}", msg.id, e);
            serde_json::json!({
                "id": msg.id,
                "kind": "error",
                "message": format!("unserializable message: {}", e),
                "code": "SERIALIZATION_ERROR",
            })
            .to_string()
        }
    };
    SseFrame {
        event: msg.kind().as_str().to_string(),
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    #[test]
    fn test_frame_layout() {
        let msg = CanonicalMessage::text(Role::Assistant, "hi");
        let frame = to_sse(&msg);
        assert_eq!(frame.event, "text");

        let rendered = frame.render();
        assert!(rendered.starts_with("event: text\ndata: {"));
        assert!(rendered.ends_with("}\n\n"));

        let data_line = rendered.lines().nth(1).unwrap_or_default();
        let parsed: serde_json::Value =
            serde_json::from_str(data_line.trim_start_matches("data: ")).unwrap();
        assert_eq!(parsed["content"], "hi");
        assert_eq!(parsed["kind"], "text");
    }

    #[test]
    fn test_done_frame_event_name() {
        let frame = to_sse(&CanonicalMessage::done("stop"));
        assert_eq!(frame.event, "done");
    }

    #[test]
    fn test_multiline_data_repeats_field() {
        let frame = SseFrame {
            event: "text".to_string(),
            data: "a\nb".to_string(),
        };
        assert_eq!(frame.render(), "event: text\ndata: a\ndata: b\n\n");
    }
}
