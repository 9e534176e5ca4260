//! Decoding of Claude Code `stream-json` lines into [`StreamEvent`]s.

use sandbox_agents_core::{EventKind, StreamEvent};
use serde_json::{Map, Value};

/// Keys searched, in order, for best-effort text extraction.
const GENERIC_TEXT_KEYS: [&str; 3] = ["content", "text", "result"];
/// Keys searched inside a nested `message` object.
const MESSAGE_TEXT_KEYS: [&str; 2] = ["content", "text"];
/// Discriminator of the incremental records emitted with partial messages.
const STREAM_EVENT: &str = "stream_event";

/// A line that could not be decoded.
///
/// Never fatal to a stream; callers log and skip it.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Expected a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// Stateless decoder from one output line to one event.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventDecoder;

impl EventDecoder {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one line.
    ///
    /// Blank lines yield `Ok(None)`.
    ///
    /// # Errors
    /// Returns error if the line is not a JSON object.
    pub fn decode(&self, line: &str) -> Result<Option<StreamEvent>, DecodeError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let data: Value = serde_json::from_str(line)?;
        let Some(object) = data.as_object() else {
            return Err(DecodeError::NotAnObject(json_type_name(&data)));
        };

        let discriminator = object.get("type").and_then(Value::as_str).unwrap_or("unknown");
        let (kind, content) = classify(discriminator, object);
        Ok(Some(StreamEvent::new(kind, data, content)))
    }
}

fn classify(discriminator: &str, object: &Map<String, Value>) -> (EventKind, String) {
    if discriminator == STREAM_EVENT {
        return classify_stream_event(object)
            .unwrap_or_else(|| (EventKind::Other(STREAM_EVENT.to_string()), String::new()));
    }

    let kind = EventKind::from_discriminator(discriminator);
    let content = match &kind {
        EventKind::ToolUse => String::new(),
        EventKind::Thinking => first_string(object, &["thinking"])
            .map_or_else(|| generic_content(object), str::to_string),
        EventKind::Text => first_string(object, &["text"])
            .map_or_else(|| generic_content(object), str::to_string),
        EventKind::Result => first_string(object, &["result"])
            .map_or_else(|| generic_content(object), str::to_string),
        EventKind::Stderr => first_string(object, &["content", "text"])
            .unwrap_or_default()
            .to_string(),
        EventKind::Other(_) => generic_content(object),
    };
    (kind, content)
}

/// Classify an incremental `stream_event` record by its inner API event.
fn classify_stream_event(object: &Map<String, Value>) -> Option<(EventKind, String)> {
    let event = object.get("event")?.as_object()?;
    match event.get("type")?.as_str()? {
        "content_block_delta" => {
            let delta = event.get("delta")?.as_object()?;
            match delta.get("type")?.as_str()? {
                "text_delta" => Some((EventKind::Text, first_string(delta, &["text"])?.to_string())),
                "thinking_delta" => Some((
                    EventKind::Thinking,
                    first_string(delta, &["thinking"])?.to_string(),
                )),
                _ => None,
            }
        }
        "content_block_start" => {
            let block = event.get("content_block")?.as_object()?;
            (block.get("type")?.as_str()? == "tool_use").then(|| (EventKind::ToolUse, String::new()))
        }
        _ => None,
    }
}

/// Best-effort text: top-level keys first, then the nested message.
fn generic_content(object: &Map<String, Value>) -> String {
    first_string(object, &GENERIC_TEXT_KEYS)
        .or_else(|| {
            object
                .get("message")
                .and_then(Value::as_object)
                .and_then(|message| first_string(message, &MESSAGE_TEXT_KEYS))
        })
        .unwrap_or_default()
        .to_string()
}

fn first_string<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| object.get(*key).and_then(Value::as_str))
}

const fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(line: &str) -> StreamEvent {
        EventDecoder::new().decode(line).unwrap().unwrap()
    }

    #[test]
    fn test_blank_lines_yield_nothing() {
        let decoder = EventDecoder::new();
        assert!(decoder.decode("").unwrap().is_none());
        assert!(decoder.decode("  \t \r").unwrap().is_none());
    }

    #[test]
    fn test_malformed_lines_are_errors() {
        let decoder = EventDecoder::new();
        assert!(matches!(decoder.decode("this is not json"), Err(DecodeError::Json(_))));
        assert!(matches!(decoder.decode("{\"type\":"), Err(DecodeError::Json(_))));
        assert!(matches!(decoder.decode("[1, 2]"), Err(DecodeError::NotAnObject("an array"))));
    }

    #[test]
    fn test_text_and_result() {
        let text = decode(r#"{"type":"text","text":"Hi"}"#);
        assert_eq!(text.kind(), &EventKind::Text);
        assert_eq!(text.content(), "Hi");

        let result = decode(r#"{"type":"result","subtype":"success","result":"done"}"#);
        assert_eq!(result.kind(), &EventKind::Result);
        assert_eq!(result.content(), "done");
        assert_eq!(result.data()["subtype"], "success");
    }

    #[test]
    fn test_thinking() {
        let event = decode(r#"{"type":"thinking","thinking":"let me see"}"#);
        assert_eq!(event.kind(), &EventKind::Thinking);
        assert_eq!(event.content(), "let me see");
    }

    #[test]
    fn test_tool_use_has_no_content_but_keeps_data() {
        let event = decode(r#"{"type":"tool_use","name":"Bash","input":{"command":"ls"},"content":"x"}"#);
        assert_eq!(event.kind(), &EventKind::ToolUse);
        assert_eq!(event.content(), "");
        assert_eq!(event.data()["name"], "Bash");
        assert_eq!(event.data()["input"], json!({"command": "ls"}));
    }

    #[test]
    fn test_text_falls_back_to_generic_keys() {
        assert_eq!(decode(r#"{"type":"text","content":"hello"}"#).content(), "hello");
        assert_eq!(
            decode(r#"{"type":"text","message":{"content":"nested"}}"#).content(),
            "nested"
        );
        assert_eq!(
            decode(r#"{"type":"text","content":"top","message":{"content":"nested"}}"#).content(),
            "top"
        );
        assert_eq!(
            decode(r#"{"type":"text","content":42,"text":"fallback"}"#).content(),
            "fallback"
        );
    }

    #[test]
    fn test_unknown_discriminator_is_not_an_error() {
        let event = decode(r#"{"type":"telemetry","foo":"bar"}"#);
        assert_eq!(event.kind(), &EventKind::Other("telemetry".into()));
        assert_eq!(event.event_type(), "telemetry");
        assert_eq!(event.content(), "");
    }

    #[test]
    fn test_missing_discriminator() {
        let event = decode(r#"{"foo":"bar"}"#);
        assert_eq!(event.event_type(), "unknown");
    }

    #[test]
    fn test_assistant_message_with_block_array_has_no_plain_content() {
        let event = decode(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hi"}]}}"#,
        );
        assert_eq!(event.event_type(), "assistant");
        assert_eq!(event.content(), "");
    }

    #[test]
    fn test_stream_event_deltas() {
        let text = decode(
            r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}}"#,
        );
        assert_eq!(text.kind(), &EventKind::Text);
        assert_eq!(text.content(), "Hel");

        let thinking = decode(
            r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}}"#,
        );
        assert_eq!(thinking.kind(), &EventKind::Thinking);
        assert_eq!(thinking.content(), "hmm");

        let tool = decode(
            r#"{"type":"stream_event","event":{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"Read","input":{}}}}"#,
        );
        assert_eq!(tool.kind(), &EventKind::ToolUse);
        assert_eq!(tool.content(), "");

        let other = decode(r#"{"type":"stream_event","event":{"type":"message_stop"}}"#);
        assert_eq!(other.kind(), &EventKind::Other("stream_event".into()));
        assert_eq!(other.content(), "");
    }

    #[test]
    fn test_decode_is_pure() {
        let line = r#"{"type":"text","text":"same"}"#;
        let a = decode(line);
        let b = decode(line);
        assert_eq!(a.kind(), b.kind());
        assert_eq!(a.content(), b.content());
    }
}
