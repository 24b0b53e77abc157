//! Canonical chunk model for the streaming response protocol.
//!
//! Contract:
//! - Every wire message is one `StreamChunk`: a stream id plus a typed payload.
//! - `Stop`, `Done` and `Error` are terminal; a stream under terminal-event
//!   enforcement must end with exactly one of them.
//! - Tool-call fragments sharing an `index` merge into one call: first-seen
//!   `id`/`type`/`name` win, `arguments` concatenate in arrival order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreResult, StreamError};

/// Token accounting reported by the provider on the usage chunk.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_text_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_text_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_image_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_output_tokens: Option<u64>,
    pub total_tokens: u64,
}

impl ModelUsage {
    /// Effective output token count used for throughput math.
    ///
    /// Falls back to summing text + image tokens when the combined total is
    /// absent (some providers omit it when image tokens are present). The
    /// fallback exists for output tokens only; input tokens are never summed.
    pub fn effective_output_tokens(&self) -> u64 {
        self.total_output_tokens.unwrap_or_else(|| {
            self.output_text_tokens.unwrap_or(0) + self.output_image_tokens.unwrap_or(0)
        })
    }
}

/// Derived timing metrics, produced only by the speed annotator.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ModelSpeed {
    /// Output tokens per second, measured from the first visible token.
    pub tps: f64,
    /// Time to first token, in milliseconds.
    pub ttft: u64,
    /// Milliseconds from the first token to the usage chunk.
    pub duration: u64,
    /// Milliseconds from request start to the usage chunk.
    pub latency: u64,
}

/// One partial tool-call fragment as it arrives on the wire.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ToolCallChunk {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    #[serde(default)]
    pub function: FunctionCallChunk,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct FunctionCallChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: String,
}

/// A fully (or partially) merged tool call, client-side.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    /// Seed a merged call from the first fragment seen at an index, with
    /// empty arguments. Used by the smoothing scheduler, which feeds every
    /// argument character through its queue instead.
    pub fn seed(chunk: &ToolCallChunk) -> Self {
        ToolCall {
            id: chunk.id.clone().unwrap_or_default(),
            call_type: chunk.call_type.clone().unwrap_or_else(|| "function".into()),
            function: FunctionCall {
                name: chunk.function.name.clone().unwrap_or_default(),
                arguments: String::new(),
            },
        }
    }
}

/// Merge incoming fragments into the per-stream working list, keyed by
/// `index`. First-seen `id`/`type`/`name` win; `arguments` concatenate.
pub fn merge_tool_calls(merged: &mut Vec<ToolCall>, fragments: &[ToolCallChunk]) {
    for chunk in fragments {
        if merged.len() <= chunk.index {
            merged.resize_with(chunk.index + 1, ToolCall::default);
        }
        let call = &mut merged[chunk.index];
        if call.id.is_empty() {
            if let Some(id) = &chunk.id {
                call.id = id.clone();
            }
        }
        if call.call_type.is_empty() {
            call.call_type = chunk.call_type.clone().unwrap_or_else(|| "function".into());
        }
        if call.function.name.is_empty() {
            if let Some(name) = &chunk.function.name {
                call.function.name = name.clone();
            }
        }
        call.function.arguments.push_str(&chunk.function.arguments);
    }
}

/// Structured content part (`content_part` / `reasoning_part` events).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    pub content: String,
    pub part_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
    /// Accepted on input but intentionally not forwarded to part callbacks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reasoning: Option<bool>,
}

/// One base64 image accumulated on the client.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageChunk {
    pub id: String,
    pub data: String,
    pub is_base64: bool,
}

/// Error payload as carried on the wire. Field order matters for byte-exact
/// encoding of the synthetic flush event.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

/// What the caller receives incrementally, after provider normalization.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkPayload {
    /// Incremental assistant text delta.
    Text(String),
    /// Incremental reasoning text delta.
    Reasoning(String),
    /// Signature attached to the reasoning block, sent once.
    ReasoningSignature(String),
    /// Ordered partial tool-call fragments.
    ToolCalls(Vec<ToolCallChunk>),
    ContentPart(MessagePart),
    ReasoningPart(MessagePart),
    /// Raw base64 image data; ids and accumulation happen client-side.
    Base64Image(String),
    Usage(ModelUsage),
    /// Provider citation/search metadata, opaque to this layer.
    Grounding(Value),
    /// Synthetic, emitted only by the speed annotator.
    Speed(ModelSpeed),
    Stop(String),
    Done,
    Error(ErrorPayload),
    /// Unrecognized but well-formed event, passed through untouched.
    Data(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    pub id: String,
    pub payload: ChunkPayload,
}

impl StreamChunk {
    pub fn new(id: impl Into<String>, payload: ChunkPayload) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }

    /// Wire event name for the `event:` line.
    pub fn event_name(&self) -> &'static str {
        match &self.payload {
            ChunkPayload::Text(_) => "text",
            ChunkPayload::Reasoning(_) => "reasoning",
            ChunkPayload::ReasoningSignature(_) => "reasoning_signature",
            ChunkPayload::ToolCalls(_) => "tool_calls",
            ChunkPayload::ContentPart(_) => "content_part",
            ChunkPayload::ReasoningPart(_) => "reasoning_part",
            ChunkPayload::Base64Image(_) => "base64_image",
            ChunkPayload::Usage(_) => "usage",
            ChunkPayload::Grounding(_) => "grounding",
            ChunkPayload::Speed(_) => "speed",
            ChunkPayload::Stop(_) => "stop",
            ChunkPayload::Done => "done",
            ChunkPayload::Error(_) => "error",
            ChunkPayload::Data(_) => "data",
        }
    }

    /// Returns true if this chunk terminates the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.payload,
            ChunkPayload::Stop(_) | ChunkPayload::Done | ChunkPayload::Error(_)
        )
    }

    /// JSON value carried on the `data:` line.
    pub fn data_value(&self) -> CoreResult<Value> {
        let value = match &self.payload {
            ChunkPayload::Text(s)
            | ChunkPayload::Reasoning(s)
            | ChunkPayload::ReasoningSignature(s)
            | ChunkPayload::Base64Image(s)
            | ChunkPayload::Stop(s) => Value::String(s.clone()),
            ChunkPayload::ToolCalls(calls) => serde_json::to_value(calls).map_err(to_parse)?,
            ChunkPayload::ContentPart(p) | ChunkPayload::ReasoningPart(p) => {
                serde_json::to_value(p).map_err(to_parse)?
            }
            ChunkPayload::Usage(u) => serde_json::to_value(u).map_err(to_parse)?,
            ChunkPayload::Grounding(v) | ChunkPayload::Data(v) => v.clone(),
            ChunkPayload::Speed(s) => serde_json::to_value(s).map_err(to_parse)?,
            ChunkPayload::Done => Value::String("done".into()),
            ChunkPayload::Error(e) => serde_json::to_value(e).map_err(to_parse)?,
        };
        Ok(value)
    }

    /// Rebuild a chunk from its wire triad. Unknown event names degrade to
    /// `Data` so the pipeline stays lossless.
    pub fn from_wire(id: impl Into<String>, event: &str, data: Value) -> CoreResult<StreamChunk> {
        let payload = match event {
            "text" => ChunkPayload::Text(as_string(data)?),
            "reasoning" => ChunkPayload::Reasoning(as_string(data)?),
            "reasoning_signature" => ChunkPayload::ReasoningSignature(as_string(data)?),
            "tool_calls" => {
                ChunkPayload::ToolCalls(serde_json::from_value(data).map_err(to_parse)?)
            }
            "content_part" => {
                ChunkPayload::ContentPart(serde_json::from_value(data).map_err(to_parse)?)
            }
            "reasoning_part" => {
                ChunkPayload::ReasoningPart(serde_json::from_value(data).map_err(to_parse)?)
            }
            "base64_image" => ChunkPayload::Base64Image(as_string(data)?),
            "usage" => ChunkPayload::Usage(serde_json::from_value(data).map_err(to_parse)?),
            "grounding" => ChunkPayload::Grounding(data),
            "speed" => ChunkPayload::Speed(serde_json::from_value(data).map_err(to_parse)?),
            "stop" => ChunkPayload::Stop(as_string(data)?),
            "done" => ChunkPayload::Done,
            "error" => ChunkPayload::Error(serde_json::from_value(data).map_err(to_parse)?),
            _ => ChunkPayload::Data(data),
        };
        Ok(StreamChunk::new(id, payload))
    }
}

fn as_string(data: Value) -> CoreResult<String> {
    match data {
        Value::String(s) => Ok(s),
        other => Err(StreamError::Parse(format!(
            "expected string payload, got {other}"
        ))),
    }
}

fn to_parse(e: serde_json::Error) -> StreamError {
    StreamError::Parse(e.to_string())
}
