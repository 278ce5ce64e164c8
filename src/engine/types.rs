//! Core types shared by the supervisor, its consumers and the display layer.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Lifecycle of the supervised worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Constructed, `spawn` not yet completed.
    Starting,
    /// Alive and ready for a turn.
    Idle,
    /// Alive with exactly one active turn.
    Busy,
    /// Terminal.
    Dead,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Idle => write!(f, "idle"),
            ProcessState::Busy => write!(f, "busy"),
            ProcessState::Dead => write!(f, "dead"),
        }
    }
}

/// Which output stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// A base64-encoded image, either attached to a turn or produced by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageData {
    /// MIME type, e.g. `image/png`.
    pub media_type: String,
    /// Base64 payload (standard alphabet, padded).
    pub data: String,
}

impl ImageData {
    pub fn new(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            data: data.into(),
        }
    }

    /// Encode raw image bytes.
    pub fn from_bytes(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            media_type: media_type.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }
}

/// A tool invocation announced by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    /// Identifier used to pair the invocation with its result.
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// One unit of a turn's ordered output.
///
/// Within a turn: zero or more `TextDelta`, optional `ToolStart`/`ToolEnd`
/// pairs, at most one of `TextFinal` or `Error`, then exactly one `Done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    TextDelta { text: String },
    TextFinal { text: String },
    ToolStart { name: String, input: Value },
    ToolEnd,
    ImageData { image: ImageData },
    LogLine { stream: LogStream, line: String },
    Error { message: String },
    Done,
}

impl EngineEvent {
    pub fn text_delta(text: impl Into<String>) -> Self {
        EngineEvent::TextDelta { text: text.into() }
    }

    pub fn text_final(text: impl Into<String>) -> Self {
        EngineEvent::TextFinal { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        EngineEvent::Error {
            message: message.into(),
        }
    }

    /// True for the event that closes a turn.
    pub fn is_done(&self) -> bool {
        matches!(self, EngineEvent::Done)
    }
}

/// Errors raised while launching or talking to the worker process.
///
/// These never cross the turn boundary: the supervisor converts them into
/// `EngineEvent::Error` or a `false` return from `spawn`.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to capture agent {0}")]
    MissingPipe(&'static str),
    #[error("failed to serialize turn input: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("agent stdin not available")]
    StdinClosed,
    #[error("failed to write to agent stdin: {0}")]
    Write(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn engine_event_serializes_with_type_tag() {
        let value = serde_json::to_value(EngineEvent::text_delta("hi")).unwrap();
        assert_eq!(value, json!({"type": "text_delta", "text": "hi"}));

        let value = serde_json::to_value(EngineEvent::Done).unwrap();
        assert_eq!(value, json!({"type": "done"}));

        let value = serde_json::to_value(EngineEvent::LogLine {
            stream: LogStream::Stderr,
            line: "warn".to_string(),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "log_line", "stream": "stderr", "line": "warn"})
        );
    }

    #[test]
    fn image_from_bytes_is_base64() {
        let image = ImageData::from_bytes("image/png", b"abc");
        assert_eq!(image.data, "YWJj");
        assert_eq!(image.media_type, "image/png");
    }

    #[test]
    fn process_state_display() {
        assert_eq!(ProcessState::Busy.to_string(), "busy");
        assert_eq!(ProcessState::Dead.to_string(), "dead");
    }
}
