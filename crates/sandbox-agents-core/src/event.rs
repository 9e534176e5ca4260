//! Typed events decoded from an agent's structured output.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Category of a [`StreamEvent`].
///
/// The closed set covers what callers branch on. Discriminators the decoder
/// does not recognize are kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Incremental or accumulated reasoning text.
    Thinking,
    /// Incremental or accumulated response text.
    Text,
    /// A tool invocation; no plain-text body.
    ToolUse,
    /// The final summarized result of a turn.
    Result,
    /// Standard-error text captured after the turn finished.
    Stderr,
    /// Raw discriminator the decoder does not classify.
    Other(String),
}

impl EventKind {
    /// Wire name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Thinking => "thinking",
            Self::Text => "text",
            Self::ToolUse => "tool_use",
            Self::Result => "result",
            Self::Stderr => "stderr",
            Self::Other(raw) => raw,
        }
    }

    /// Map a discriminator to its kind, keeping unknown values as `Other`.
    #[must_use]
    pub fn from_discriminator(raw: &str) -> Self {
        match raw {
            "thinking" => Self::Thinking,
            "text" => Self::Text,
            "tool_use" => Self::ToolUse,
            "result" => Self::Result,
            "stderr" => Self::Stderr,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_discriminator(&raw))
    }
}

/// A single decoded unit of agent output.
///
/// Built once from exactly one output line (or synthesized for stderr at the
/// end of a turn) and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    kind: EventKind,
    data: Value,
    content: String,
}

impl StreamEvent {
    /// Create an event from its parts.
    #[must_use]
    pub fn new(kind: EventKind, data: Value, content: impl Into<String>) -> Self {
        Self {
            kind,
            data,
            content: content.into(),
        }
    }

    /// Synthesize the trailing stderr event of a turn.
    #[must_use]
    pub fn stderr(text: impl Into<String>) -> Self {
        let text = text.into();
        let data = serde_json::json!({ "type": "stderr", "content": text });
        Self::new(EventKind::Stderr, data, text)
    }

    #[must_use]
    pub const fn kind(&self) -> &EventKind {
        &self.kind
    }

    /// Wire name of the event type.
    #[must_use]
    pub fn event_type(&self) -> &str {
        self.kind.as_str()
    }

    /// Raw decoded payload of the line.
    #[must_use]
    pub const fn data(&self) -> &Value {
        &self.data
    }

    /// Human-readable text, empty when the event carries none.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    #[must_use]
    pub fn into_parts(self) -> (EventKind, Value, String) {
        (self.kind, self.data, self.content)
    }
}
