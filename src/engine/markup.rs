//! Tool-use markup filtering for streamed text.
//!
//! The agent sometimes narrates tool calls inline, wrapped in
//! `<tool_use>`…`</tool_use>`. That narration is kept out of live deltas but
//! stays in the merged transcript, so the markers have to be tracked across
//! chunk boundaries.

pub const TOOL_OPEN: &str = "<tool_use>";
pub const TOOL_CLOSE: &str = "</tool_use>";

/// Stateful scanner that separates visible text from tool-use spans.
#[derive(Debug, Default)]
pub struct ToolMarkupFilter {
    in_tool: bool,
    /// Suffix of the last chunk that could be the start of a marker.
    held: String,
}

impl ToolMarkupFilter {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    /// Whether the scanner is currently inside a tool-use span.
    pub fn in_tool(&self) -> bool {
        self.in_tool
    }

    /// Feed a chunk and return the part of it that should be shown.
    pub fn push(&mut self, chunk: &str) -> String {
        let mut text = std::mem::take(&mut self.held);
        text.push_str(chunk);

        let mut visible = String::new();
        let mut rest = text.as_str();
        loop {
            let marker = if self.in_tool { TOOL_CLOSE } else { TOOL_OPEN };
            match rest.find(marker) {
                Some(idx) => {
                    if !self.in_tool {
                        visible.push_str(&rest[..idx]);
                    }
                    rest = &rest[idx + marker.len()..];
                    self.in_tool = !self.in_tool;
                }
                None => {
                    let keep = partial_marker_len(rest, marker);
                    let (body, tail) = rest.split_at(rest.len() - keep);
                    if !self.in_tool {
                        visible.push_str(body);
                    }
                    self.held = tail.to_string();
                    break;
                }
            }
        }
        visible
    }

    /// Release held-back text at end of turn. Nothing is returned from inside
    /// an unterminated span.
    pub fn finish(&mut self) -> String {
        let held = std::mem::take(&mut self.held);
        if self.in_tool {
            String::new()
        } else {
            held
        }
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `marker`.
fn partial_marker_len(text: &str, marker: &str) -> usize {
    (1..marker.len())
        .rev()
        .find(|&k| text.ends_with(&marker[..k]))
        .unwrap_or(0)
}

/// Remove marker tags but keep whatever text they enclosed.
pub fn strip_markers(text: &str) -> String {
    text.replace(TOOL_OPEN, "").replace(TOOL_CLOSE, "")
}
