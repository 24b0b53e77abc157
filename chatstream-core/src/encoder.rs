//! Protocol encoder: canonical chunks -> wire lines.
//!
//! Each chunk becomes an `id` / `event` / `data` triad. In enforced mode the
//! encoder tracks whether any terminal chunk passed through; if the stream
//! closes without one, `flush` synthesizes a single error event using the
//! originally supplied stream id, letting a consumer distinguish a clean
//! finish from a producer that died mid-stream.

use serde_json::json;

use crate::chunk::{ChunkPayload, ErrorPayload, StreamChunk};
use crate::error::CoreResult;

#[derive(Debug, Clone, Copy, Default)]
pub struct SseEncoderOptions {
    /// Require exactly one terminal event per stream. Default off.
    pub require_terminal_event: bool,
}

pub struct SseEncoder {
    stream_id: String,
    options: SseEncoderOptions,
    saw_terminal: bool,
}

impl SseEncoder {
    pub fn new(stream_id: impl Into<String>, options: SseEncoderOptions) -> Self {
        Self {
            stream_id: stream_id.into(),
            options,
            saw_terminal: false,
        }
    }

    /// Serialize one chunk into its three wire lines.
    pub fn encode(&mut self, chunk: &StreamChunk) -> CoreResult<Vec<String>> {
        if chunk.is_terminal() {
            self.saw_terminal = true;
        }
        let data = serde_json::to_string(&chunk.data_value()?)
            .map_err(|e| crate::error::StreamError::Parse(e.to_string()))?;
        Ok(vec![
            format!("id: {}\n", chunk.id),
            format!("event: {}\n", chunk.event_name()),
            format!("data: {data}\n\n"),
        ])
    }

    /// Called at stream close. A no-op unless enforcement is on and no
    /// terminal chunk was ever seen, in which case one synthetic error event
    /// is emitted under the stream id supplied at construction.
    pub fn flush(&mut self) -> Vec<String> {
        if !self.options.require_terminal_event || self.saw_terminal {
            return Vec::new();
        }
        self.saw_terminal = true;
        let chunk = StreamChunk::new(
            self.stream_id.clone(),
            ChunkPayload::Error(ErrorPayload {
                body: json!({ "name": "Stream parsing error", "reason": "unexpected_end" }),
                message: "Stream ended unexpectedly".into(),
                name: Some("Stream parsing error".into()),
                error_type: Some("StreamChunkError".into()),
            }),
        );
        // The synthetic chunk always serializes.
        self.encode(&chunk).unwrap_or_default()
    }
}
