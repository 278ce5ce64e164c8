//! Interpretation of inbound wire records.
//!
//! The supervisor only knows that a `result` record ends a turn. Everything
//! else (where text lives, what a tool call looks like, where images hide) is
//! behind [`WireDecoder`], so a different agent CLI or protocol revision can be
//! plugged in without touching the process lifecycle.

use serde_json::Value;

use super::markup::strip_markers;
use super::protocol::{parse_blocks, record_type, ContentBlock, ToolResultBlock, RESULT_RECORD};
use super::types::{ImageData, ToolUse};

/// Text and images carried by a `result` record whose payload is a block list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultContent {
    pub text: Option<String>,
    pub images: Vec<ImageData>,
}

/// One piece of a mid-turn record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordPart {
    Text(String),
    ToolUse(ToolUse),
    /// Id of the tool invocation that finished.
    ToolResult(String),
    Image(ImageData),
}

/// Pluggable decoder for agent output records.
#[cfg_attr(test, mockall::automock)]
pub trait WireDecoder: Send + Sync {
    /// Parse one output line. `None` for malformed or irrelevant lines.
    fn parse_line(&self, line: &str) -> Option<Value>;

    /// Streamed assistant text carried by a mid-turn record.
    fn extract_text(&self, record: &Value) -> Option<String>;

    /// Final text of a `result` record when its payload is a string.
    fn extract_result_text(&self, record: &Value) -> Option<String>;

    /// Text and images of a `result` record whose payload is a block list.
    fn extract_result_content_blocks(&self, record: &Value) -> Option<ResultContent>;

    /// Inline images carried by a mid-turn record.
    fn extract_images(&self, record: &Value) -> Vec<ImageData>;

    /// Remove tool-use markup tags from text.
    fn strip_tool_markup(&self, text: &str) -> String;

    /// Tool invocations announced by a record.
    fn extract_tool_uses(&self, _record: &Value) -> Vec<ToolUse> {
        Vec::new()
    }

    /// Ids of tool invocations completed by a record.
    fn extract_tool_results(&self, _record: &Value) -> Vec<String> {
        Vec::new()
    }

    /// Error reported by a `result` record, if the agent marked the turn failed.
    fn extract_result_error(&self, _record: &Value) -> Option<String> {
        None
    }

    /// Everything a mid-turn record carries, in the order the supervisor
    /// should surface it. The default groups parts by kind; decoders that
    /// see individual content blocks should keep their order.
    fn decode_record(&self, record: &Value) -> Vec<RecordPart> {
        let mut parts: Vec<RecordPart> = self
            .extract_text(record)
            .map(RecordPart::Text)
            .into_iter()
            .collect();
        parts.extend(self.extract_tool_uses(record).into_iter().map(RecordPart::ToolUse));
        parts.extend(
            self.extract_tool_results(record)
                .into_iter()
                .map(RecordPart::ToolResult),
        );
        parts.extend(self.extract_images(record).into_iter().map(RecordPart::Image));
        parts
    }
}

/// Decoder for the Claude CLI stream-json output.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClaudeStreamDecoder {
    /// With `--include-partial-messages`, live text comes from `stream_event`
    /// deltas and the complete `assistant` records would repeat it.
    pub partial_messages: bool,
}

impl ClaudeStreamDecoder {
    pub fn new(partial_messages: bool) -> Self {
        Self { partial_messages }
    }

    fn message_blocks(record: &Value) -> Vec<ContentBlock> {
        record
            .get("message")
            .and_then(|m| m.get("content"))
            .map(parse_blocks)
            .unwrap_or_default()
    }

    fn is_result(record: &Value) -> bool {
        record_type(record) == Some(RESULT_RECORD)
    }

    fn nested_images(result: &ToolResultBlock) -> impl Iterator<Item = ImageData> {
        parse_blocks(&result.content)
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Image(block) => block.to_image(),
                _ => None,
            })
    }
}

/// Record types that never matter for a turn's output.
const IGNORED_RECORDS: &[&str] = &["system", "keep_alive", "control_request", "control_response"];

impl WireDecoder for ClaudeStreamDecoder {
    fn parse_line(&self, line: &str) -> Option<Value> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let value: Value = serde_json::from_str(trimmed).ok()?;
        let kind = record_type(&value)?;
        if IGNORED_RECORDS.contains(&kind) {
            return None;
        }
        Some(value)
    }

    fn extract_text(&self, record: &Value) -> Option<String> {
        let text = match record_type(record)? {
            "stream_event" if self.partial_messages => {
                let event = record.get("event")?;
                if event.get("type").and_then(Value::as_str) != Some("content_block_delta") {
                    return None;
                }
                let delta = event.get("delta")?;
                if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
                    return None;
                }
                delta.get("text").and_then(Value::as_str)?.to_string()
            }
            "assistant" if !self.partial_messages => Self::message_blocks(record)
                .into_iter()
                .filter_map(|block| match block {
                    ContentBlock::Text(text) => Some(text.text),
                    _ => None,
                })
                .collect::<String>(),
            _ => return None,
        };
        (!text.is_empty()).then_some(text)
    }

    fn extract_result_text(&self, record: &Value) -> Option<String> {
        if !Self::is_result(record) {
            return None;
        }
        record
            .get("result")
            .and_then(Value::as_str)
            .filter(|text| !text.trim().is_empty())
            .map(str::to_string)
    }

    fn extract_result_content_blocks(&self, record: &Value) -> Option<ResultContent> {
        if !Self::is_result(record) {
            return None;
        }
        let payload = record.get("result").filter(|v| v.is_array())?;
        let mut content = ResultContent::default();
        let mut text = String::new();
        for block in parse_blocks(payload) {
            match block {
                ContentBlock::Text(block) => text.push_str(&block.text),
                ContentBlock::Image(block) => content.images.extend(block.to_image()),
                _ => {}
            }
        }
        if !text.trim().is_empty() {
            content.text = Some(text);
        }
        Some(content)
    }

    fn extract_images(&self, record: &Value) -> Vec<ImageData> {
        if !matches!(record_type(record), Some("assistant") | Some("user")) {
            return Vec::new();
        }
        let mut images = Vec::new();
        for block in Self::message_blocks(record) {
            match block {
                ContentBlock::Image(block) => images.extend(block.to_image()),
                ContentBlock::ToolResult(result) => images.extend(Self::nested_images(&result)),
                _ => {}
            }
        }
        images
    }

    fn strip_tool_markup(&self, text: &str) -> String {
        strip_markers(text)
    }

    fn extract_tool_uses(&self, record: &Value) -> Vec<ToolUse> {
        if record_type(record) != Some("assistant") {
            return Vec::new();
        }
        Self::message_blocks(record)
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse(tool) => Some(ToolUse {
                    id: tool.id,
                    name: tool.name,
                    input: tool.input,
                }),
                _ => None,
            })
            .collect()
    }

    fn extract_tool_results(&self, record: &Value) -> Vec<String> {
        if record_type(record) != Some("user") {
            return Vec::new();
        }
        Self::message_blocks(record)
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::ToolResult(result) => Some(result.tool_use_id),
                _ => None,
            })
            .collect()
    }

    fn extract_result_error(&self, record: &Value) -> Option<String> {
        if !Self::is_result(record) {
            return None;
        }
        if !record.get("is_error").and_then(Value::as_bool).unwrap_or(false) {
            return None;
        }
        let message = record
            .get("result")
            .and_then(Value::as_str)
            .filter(|text| !text.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                let subtype = record
                    .get("subtype")
                    .and_then(Value::as_str)
                    .unwrap_or("error");
                format!("agent reported {}", subtype)
            });
        Some(message)
    }

    fn decode_record(&self, record: &Value) -> Vec<RecordPart> {
        let assistant = match record_type(record) {
            Some("assistant") => true,
            Some("user") => false,
            _ => {
                return self
                    .extract_text(record)
                    .map(RecordPart::Text)
                    .into_iter()
                    .collect()
            }
        };
        let mut parts = Vec::new();
        for block in Self::message_blocks(record) {
            match block {
                ContentBlock::Text(block) if assistant && !self.partial_messages => {
                    if block.text.is_empty() {
                        continue;
                    }
                    // Adjacent text blocks become one delta.
                    match parts.last_mut() {
                        Some(RecordPart::Text(text)) => text.push_str(&block.text),
                        _ => parts.push(RecordPart::Text(block.text)),
                    }
                }
                ContentBlock::ToolUse(tool) if assistant => {
                    parts.push(RecordPart::ToolUse(ToolUse {
                        id: tool.id,
                        name: tool.name,
                        input: tool.input,
                    }))
                }
                ContentBlock::ToolResult(result) => {
                    if !assistant {
                        parts.push(RecordPart::ToolResult(result.tool_use_id.clone()));
                    }
                    parts.extend(Self::nested_images(&result).map(RecordPart::Image));
                }
                ContentBlock::Image(block) => parts.extend(block.to_image().map(RecordPart::Image)),
                _ => {}
            }
        }
        parts
    }
}
