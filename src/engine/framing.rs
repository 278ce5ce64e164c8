//! Line framing for the agent's stdout.
//!
//! Output arrives in arbitrary chunks; records are newline-delimited. The
//! buffer works on bytes so a multi-byte character split across two reads is
//! reassembled before decoding.

/// Rolling buffer that yields complete lines and keeps the trailing partial one.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completes, without terminators.
    ///
    /// Both `\n` and `\r` end a line, so `\r\n` produces one empty line which
    /// callers skip along with other blank lines.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        for (idx, byte) in self.pending.iter().enumerate() {
            if *byte == b'\n' || *byte == b'\r' {
                lines.push(String::from_utf8_lossy(&self.pending[start..idx]).into_owned());
                start = idx + 1;
            }
        }
        self.pending.drain(..start);
        lines
    }

    /// Take whatever partial line is left (used at end of stream).
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
