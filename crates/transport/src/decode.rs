//! Incremental decoder for the chat stream's `data: <json>` line framing.
//!
//! Bytes may arrive split at arbitrary boundaries, so the decoder keeps the
//! trailing incomplete line in a residual buffer across feeds. One decoder
//! is owned per streaming response, never recreated per chunk.

use serde::Deserialize;
use shared::types::ActionRecord;

/// A recognized event from the chat stream.
///
/// The backend also emits progress frames (`thinking`, `action_start`);
/// those fall through the same skip path as malformed lines.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Final answer for the turn.
    Complete {
        reply: String,
        #[serde(default)]
        brain: Option<String>,
        #[serde(default)]
        actions: Vec<ActionRecord>,
    },
    /// A tool step finished while the turn was being processed.
    Action {
        tool: String,
        #[serde(default)]
        description: Option<String>,
        success: bool,
    },
}

/// Line-buffered decoder holding undecoded residual bytes across reads.
///
/// The buffer is bytes, not text: a multibyte character split across two
/// chunks decodes correctly once its line completes.
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed raw bytes from the response body. Returns any complete events found.
    ///
    /// Blank lines, lines without the `data:` prefix, and `data:` payloads
    /// that do not deserialize as a recognized event are skipped, never an
    /// error.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']).trim();

            if line.is_empty() {
                continue;
            }
            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            match serde_json::from_str::<StreamEvent>(payload.trim_start_matches(' ')) {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::debug!("skipping unrecognized stream line: {}", e);
                }
            }
        }

        events
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}
