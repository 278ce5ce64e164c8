//! Claude CLI stream-json protocol types.
//!
//! The CLI speaks newline-delimited JSON in both directions when launched with
//! `--input-format stream-json --output-format stream-json`:
//!
//! - we write one `user` record per turn, whose content is either a plain
//!   string or a list of content blocks (text first, then images);
//! - it emits `system`, `assistant`, `user` (tool results), `stream_event`
//!   (with `--include-partial-messages`) and finally a `result` record per turn.
//!
//! Only the shapes this crate reads or writes are modelled; everything else is
//! left as `serde_json::Value`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{EngineError, ImageData};

/// Record `type` that marks the end of a turn.
pub const RESULT_RECORD: &str = "result";

// ============================================================================
// Outbound
// ============================================================================

/// One user turn, serialized as a single stdin line.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingUserMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub message: UserMessagePayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserMessagePayload {
    pub role: &'static str,
    pub content: UserContent,
}

/// Plain text when there are no attachments, blocks otherwise.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<InputBlock>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    /// Always `base64` for attachments we send.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub data: String,
}

impl From<&ImageData> for ImageSource {
    fn from(image: &ImageData) -> Self {
        Self {
            kind: "base64".to_string(),
            media_type: image.media_type.clone(),
            data: image.data.clone(),
        }
    }
}

impl OutgoingUserMessage {
    pub fn new(prompt: &str, images: &[ImageData]) -> Self {
        let content = if images.is_empty() {
            UserContent::Text(prompt.to_string())
        } else {
            let mut blocks = Vec::with_capacity(images.len() + 1);
            blocks.push(InputBlock::Text {
                text: prompt.to_string(),
            });
            blocks.extend(images.iter().map(|image| InputBlock::Image {
                source: image.into(),
            }));
            UserContent::Blocks(blocks)
        };
        Self {
            kind: "user",
            message: UserMessagePayload {
                role: "user",
                content,
            },
        }
    }

    /// Serialize as one newline-terminated wire line.
    pub fn to_line(&self) -> Result<String, EngineError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

// ============================================================================
// Inbound content blocks
// ============================================================================

/// Content block types that can appear in `assistant`, `user` and `result`
/// content arrays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text(TextBlock),
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultBlock),
    Image(ImageBlock),
    /// Block types added in future CLI versions.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUseBlock {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    /// String or a list of content blocks.
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageBlock {
    pub source: ImageSource,
}

impl ImageBlock {
    /// Only inline base64 images can be surfaced.
    pub fn to_image(&self) -> Option<ImageData> {
        (self.source.kind == "base64")
            .then(|| ImageData::new(self.source.media_type.clone(), self.source.data.clone()))
    }
}

/// Parse a JSON array of blocks, skipping entries that don't fit any shape.
pub fn parse_blocks(value: &Value) -> Vec<ContentBlock> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Record `type` field, if any.
pub fn record_type(record: &Value) -> Option<&str> {
    record.get("type").and_then(Value::as_str)
}
