//! Callback decoder: wire lines -> typed per-event callbacks -> one aggregate.
//!
//! Contract:
//! - Each recognized event kind invokes its registered callback with a
//!   type-appropriate payload, not the raw chunk envelope.
//! - A malformed data payload is skipped with a diagnostic; the decoder never
//!   aborts the stream over a single bad line.
//! - Tool-call fragments merge into a per-stream working list keyed by index.
//! - `finish` assembles one aggregate from everything observed and hands an
//!   identical payload to both `on_completion` and `on_final`.

use serde_json::Value;

use crate::chunk::{
    merge_tool_calls, ChunkPayload, ImageChunk, MessagePart, ModelSpeed, ModelUsage, StreamChunk,
    ToolCall, ToolCallChunk,
};
use crate::sse::{SseMessage, SseParser, DONE_HEARTBEAT};

/// A structured part as forwarded to part callbacks.
///
/// The wire-level `inReasoning` flag is accepted on input but deliberately
/// not carried here.
#[derive(Debug, Clone, PartialEq)]
pub struct PartEvent {
    pub content: String,
    pub part_type: String,
    pub mime_type: Option<String>,
    pub thought_signature: Option<String>,
}

impl From<MessagePart> for PartEvent {
    fn from(part: MessagePart) -> Self {
        PartEvent {
            content: part.content,
            part_type: part.part_type,
            mime_type: part.mime_type,
            thought_signature: part.thought_signature,
        }
    }
}

/// Payload for `on_tools_calling`: the raw delta plus the merged list so far.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolsCallingEvent {
    pub chunk: Vec<ToolCallChunk>,
    pub tools_calling: Vec<ToolCall>,
}

/// Payload for `on_base64_image`: the new image plus the running set.
#[derive(Debug, Clone, PartialEq)]
pub struct Base64ImageEvent {
    pub id: String,
    pub image: ImageChunk,
    pub images: Vec<ImageChunk>,
}

/// Aggregate handed to completion callbacks exactly once, at stream end.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamCompletion {
    pub text: String,
    pub thinking: Option<String>,
    pub thinking_signature: Option<String>,
    pub grounding: Option<Value>,
    pub speed: Option<ModelSpeed>,
    pub usage: Option<ModelUsage>,
    pub tools_calling: Option<Vec<ToolCall>>,
}

type Cb<T> = Option<Box<dyn FnMut(&T) + Send>>;

/// Independently-registrable hooks over the decoded stream.
#[derive(Default)]
pub struct StreamCallbacks {
    pub on_text: Cb<str>,
    pub on_thinking: Cb<str>,
    pub on_usage: Cb<ModelUsage>,
    pub on_speed: Cb<ModelSpeed>,
    pub on_grounding: Cb<Value>,
    pub on_base64_image: Cb<Base64ImageEvent>,
    pub on_content_part: Cb<PartEvent>,
    pub on_reasoning_part: Cb<PartEvent>,
    pub on_tools_calling: Cb<ToolsCallingEvent>,
    pub on_completion: Cb<StreamCompletion>,
    pub on_final: Cb<StreamCompletion>,
}

pub struct CallbackDecoder {
    callbacks: StreamCallbacks,
    parser: SseParser,
    text: String,
    thinking: String,
    thinking_signature: Option<String>,
    grounding: Option<Value>,
    usage: Option<ModelUsage>,
    speed: Option<ModelSpeed>,
    images: Vec<ImageChunk>,
    tools: Vec<ToolCall>,
    has_tools: bool,
    finished: bool,
}

impl CallbackDecoder {
    pub fn new(callbacks: StreamCallbacks) -> Self {
        Self {
            callbacks,
            parser: SseParser::new(),
            text: String::new(),
            thinking: String::new(),
            thinking_signature: None,
            grounding: None,
            usage: None,
            speed: None,
            images: Vec::new(),
            tools: Vec::new(),
            has_tools: false,
            finished: false,
        }
    }

    /// Feed one raw wire line (without its trailing newline).
    pub fn feed_line(&mut self, line: &str) {
        if let Some(msg) = self.parser.push_line(line) {
            self.handle(msg);
        }
    }

    /// Consume one already-assembled SSE message.
    pub fn handle(&mut self, msg: SseMessage) {
        if msg.data.is_empty() || msg.data == DONE_HEARTBEAT {
            return;
        }
        let value: Value = match serde_json::from_str(&msg.data) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, event = %msg.event, "skipping malformed chunk payload");
                return;
            }
        };
        let chunk = match StreamChunk::from_wire(msg.id, &msg.event, value) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, event = %msg.event, "skipping unusable chunk");
                return;
            }
        };
        self.dispatch(chunk);
    }

    fn dispatch(&mut self, chunk: StreamChunk) {
        match chunk.payload {
            ChunkPayload::Text(delta) => {
                self.text.push_str(&delta);
                if let Some(cb) = &mut self.callbacks.on_text {
                    cb(&delta);
                }
            }
            ChunkPayload::Reasoning(delta) => {
                self.thinking.push_str(&delta);
                if let Some(cb) = &mut self.callbacks.on_thinking {
                    cb(&delta);
                }
            }
            ChunkPayload::ReasoningSignature(sig) => {
                self.thinking_signature = Some(sig);
            }
            ChunkPayload::Usage(usage) => {
                if let Some(cb) = &mut self.callbacks.on_usage {
                    cb(&usage);
                }
                self.usage = Some(usage);
            }
            ChunkPayload::Grounding(grounding) => {
                if let Some(cb) = &mut self.callbacks.on_grounding {
                    cb(&grounding);
                }
                self.grounding = Some(grounding);
            }
            ChunkPayload::Speed(speed) => {
                if let Some(cb) = &mut self.callbacks.on_speed {
                    cb(&speed);
                }
                self.speed = Some(speed);
            }
            ChunkPayload::Base64Image(data) => {
                let id = format!("tmp_img_{}", uuid::Uuid::new_v4().simple());
                let image = ImageChunk {
                    id: id.clone(),
                    data,
                    is_base64: true,
                };
                self.images.push(image.clone());
                if let Some(cb) = &mut self.callbacks.on_base64_image {
                    cb(&Base64ImageEvent {
                        id,
                        image,
                        images: self.images.clone(),
                    });
                }
            }
            ChunkPayload::ContentPart(part) => {
                if let Some(cb) = &mut self.callbacks.on_content_part {
                    cb(&PartEvent::from(part));
                }
            }
            ChunkPayload::ReasoningPart(part) => {
                if let Some(cb) = &mut self.callbacks.on_reasoning_part {
                    cb(&PartEvent::from(part));
                }
            }
            ChunkPayload::ToolCalls(fragments) => {
                self.has_tools = true;
                merge_tool_calls(&mut self.tools, &fragments);
                if let Some(cb) = &mut self.callbacks.on_tools_calling {
                    cb(&ToolsCallingEvent {
                        chunk: fragments,
                        tools_calling: self.tools.clone(),
                    });
                }
            }
            // Terminal markers and opaque passthrough carry no aggregate state.
            ChunkPayload::Stop(_)
            | ChunkPayload::Done
            | ChunkPayload::Error(_)
            | ChunkPayload::Data(_) => {}
        }
    }

    /// Running set of images observed so far.
    pub fn images(&self) -> &[ImageChunk] {
        &self.images
    }

    /// Assemble the aggregate and fire completion hooks (once).
    pub fn finish(&mut self) -> StreamCompletion {
        let completion = StreamCompletion {
            text: self.text.clone(),
            thinking: (!self.thinking.is_empty()).then(|| self.thinking.clone()),
            thinking_signature: self.thinking_signature.clone(),
            grounding: self.grounding.clone(),
            speed: self.speed.clone(),
            usage: self.usage.clone(),
            tools_calling: self.has_tools.then(|| self.tools.clone()),
        };
        if !self.finished {
            self.finished = true;
            if let Some(cb) = &mut self.callbacks.on_completion {
                cb(&completion);
            }
            if let Some(cb) = &mut self.callbacks.on_final {
                cb(&completion);
            }
        }
        completion
    }
}
