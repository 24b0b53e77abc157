//! Stream orchestrator: transport -> decoders -> smoothing -> user callbacks.
//!
//! One call drives one stream through
//! `idle -> open -> streaming -> {done | error | abort} -> closed`.
//! Text-bearing events (text, reasoning, tool-call arguments) are routed
//! through the smoothing queues when enabled; structural events (usage,
//! grounding, images, parts) dispatch synchronously in arrival order.
//! Cancellation is classified as abort, never as error: schedulers halt
//! without draining, the abort callback receives the visible output so far,
//! and the finish callback does not fire.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chunk::{ErrorPayload, ImageChunk, ModelSpeed, ModelUsage, ToolCall};
use crate::decoder::{Base64ImageEvent, CallbackDecoder, StreamCallbacks, ToolsCallingEvent};
use crate::error::{CoreResult, StreamError};
use crate::smooth::{SmoothText, SmoothToolCalls, CATCH_UP_ANIMATION_SPEED};
use crate::sse::SseMessage;
use crate::transport::{EventSourceClient, EventSourceHandler, EventSourceRequest};

/// Response headers carrying opaque trace metadata, surfaced verbatim in the
/// finish payload.
pub const TRACE_ID_HEADER: &str = "x-chatstream-trace-id";
pub const OBSERVATION_ID_HEADER: &str = "x-chatstream-observation-id";

/// Default sentinel matched against transport error messages to classify a
/// cancellation that did not come from our own token.
pub const DEFAULT_CANCEL_SENTINEL: &str = "canceled";

/// Per-call smoothing settings. `text` defaults off; `tools_calling` defaults
/// on even when text smoothing is not requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmoothingConfig {
    pub text: bool,
    pub tools_calling: bool,
    /// Fixed drain speed in characters per tick; None picks the presets
    /// (slow while streaming, catch-up after).
    pub speed: Option<usize>,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            text: false,
            tools_calling: true,
            speed: None,
        }
    }
}

impl From<bool> for SmoothingConfig {
    fn from(enabled: bool) -> Self {
        Self {
            text: enabled,
            tools_calling: enabled,
            speed: None,
        }
    }
}

impl From<&crate::config::AnimationCfg> for SmoothingConfig {
    fn from(cfg: &crate::config::AnimationCfg) -> Self {
        Self {
            text: cfg.smooth_text,
            tools_calling: cfg.smooth_tool_calls,
            speed: cfg.speed,
        }
    }
}

/// Incremental unit handed to `on_message_handle`, post-smoothing for the
/// paced kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageChunk {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    Grounding {
        grounding: Value,
    },
    ToolCalls {
        tool_calls: Vec<ToolCall>,
        /// Per-index animation activity snapshot; None when unsmoothed.
        is_animation_actives: Option<Vec<bool>>,
    },
    Base64Image(Base64ImageEvent),
    Usage {
        usage: ModelUsage,
    },
    Speed {
        speed: ModelSpeed,
    },
    Stop {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishType {
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reasoning {
    pub content: String,
    pub signature: Option<String>,
}

/// Everything the finish callback receives alongside the assembled text.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishContext {
    pub finish_type: FinishType,
    pub grounding: Option<Value>,
    pub images: Vec<ImageChunk>,
    pub observation_id: Option<String>,
    pub reasoning: Option<Reasoning>,
    pub speed: Option<ModelSpeed>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub trace_id: Option<String>,
    pub usage: Option<ModelUsage>,
}

/// How the stream ended, for callers that prefer a return value over hooks.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Done { text: String },
    Abort { text: String },
}

type MessageHandle = Box<dyn FnMut(&MessageChunk) + Send>;

pub struct FetchSseOptions {
    pub method: http::Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub smoothing: SmoothingConfig,
    pub signal: CancellationToken,
    /// Matched against opaque transport error messages when classifying
    /// abort vs error.
    pub cancel_sentinel: String,
    /// Injectable transport; None builds a default client.
    pub client: Option<EventSourceClient>,
    pub on_message_handle: Option<MessageHandle>,
    pub on_finish: Option<Box<dyn FnMut(&str, &FinishContext) + Send>>,
    pub on_error_handle: Option<Box<dyn FnMut(&ErrorPayload) + Send>>,
    pub on_abort: Option<Box<dyn FnMut(&str) + Send>>,
}

impl Default for FetchSseOptions {
    fn default() -> Self {
        Self {
            method: http::Method::POST,
            headers: Vec::new(),
            body: None,
            smoothing: SmoothingConfig::default(),
            signal: CancellationToken::new(),
            cancel_sentinel: DEFAULT_CANCEL_SENTINEL.into(),
            client: None,
            on_message_handle: None,
            on_finish: None,
            on_error_handle: None,
            on_abort: None,
        }
    }
}

/// Visible-output state shared between the decode path and the spawned
/// animation drains. `output` tracks what the caller has actually seen,
/// which on abort may lag the network.
struct Hub {
    on_message: Option<MessageHandle>,
    output: String,
    thinking: String,
}

impl Hub {
    fn emit(&mut self, chunk: &MessageChunk) {
        if let Some(cb) = &mut self.on_message {
            cb(chunk);
        }
    }
}

struct ChannelHandler {
    tx: mpsc::UnboundedSender<SseMessage>,
}

#[async_trait::async_trait]
impl EventSourceHandler for ChannelHandler {
    fn on_message(&mut self, message: SseMessage) {
        // Receiver gone means the orchestrator already bailed.
        let _ = self.tx.send(message);
    }
}

/// Issue one streaming request and drive it to a terminal outcome.
pub async fn fetch_sse(
    url: impl Into<String>,
    mut options: FetchSseOptions,
) -> CoreResult<FetchOutcome> {
    let url = url.into();
    let smoothing = options.smoothing.clone();
    let catch_up = smoothing.speed.unwrap_or(CATCH_UP_ANIMATION_SPEED);

    let hub = Arc::new(Mutex::new(Hub {
        on_message: options.on_message_handle.take(),
        output: String::new(),
        thinking: String::new(),
    }));
    let handles: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

    let smooth_text = {
        let hub = hub.clone();
        SmoothText::new(
            Arc::new(move |delta: &str, buffer: &str| {
                let mut hub = hub.lock().unwrap();
                hub.output = buffer.to_string();
                let chunk = MessageChunk::Text {
                    text: delta.to_string(),
                };
                hub.emit(&chunk);
            }),
            smoothing.speed,
        )
    };
    let smooth_thinking = {
        let hub = hub.clone();
        SmoothText::new(
            Arc::new(move |delta: &str, buffer: &str| {
                let mut hub = hub.lock().unwrap();
                hub.thinking = buffer.to_string();
                let chunk = MessageChunk::Reasoning {
                    text: delta.to_string(),
                };
                hub.emit(&chunk);
            }),
            smoothing.speed,
        )
    };
    let smooth_tools = {
        let hub = hub.clone();
        SmoothToolCalls::new(
            Arc::new(move |calls: &[ToolCall], actives: &[bool]| {
                let mut hub = hub.lock().unwrap();
                let chunk = MessageChunk::ToolCalls {
                    tool_calls: calls.to_vec(),
                    is_animation_actives: Some(actives.to_vec()),
                };
                hub.emit(&chunk);
            }),
            smoothing.speed,
        )
    };

    let callbacks = StreamCallbacks {
        on_text: Some({
            let hub = hub.clone();
            let smooth = smooth_text.clone();
            let handles = handles.clone();
            let smoothed = smoothing.text;
            Box::new(move |delta: &str| {
                if smoothed {
                    smooth.push_to_queue(delta);
                    if !smooth.is_animation_active() {
                        let drainer = smooth.clone();
                        handles.lock().unwrap().push(tokio::spawn(async move {
                            let speed = drainer.start_speed();
                            drainer.start_animation(speed).await;
                        }));
                    }
                } else {
                    let mut hub = hub.lock().unwrap();
                    hub.output.push_str(delta);
                    let chunk = MessageChunk::Text {
                        text: delta.to_string(),
                    };
                    hub.emit(&chunk);
                }
            })
        }),
        on_thinking: Some({
            let hub = hub.clone();
            let smooth = smooth_thinking.clone();
            let handles = handles.clone();
            let smoothed = smoothing.text;
            Box::new(move |delta: &str| {
                if smoothed {
                    smooth.push_to_queue(delta);
                    if !smooth.is_animation_active() {
                        let drainer = smooth.clone();
                        handles.lock().unwrap().push(tokio::spawn(async move {
                            let speed = drainer.start_speed();
                            drainer.start_animation(speed).await;
                        }));
                    }
                } else {
                    let mut hub = hub.lock().unwrap();
                    hub.thinking.push_str(delta);
                    let chunk = MessageChunk::Reasoning {
                        text: delta.to_string(),
                    };
                    hub.emit(&chunk);
                }
            })
        }),
        on_usage: Some({
            let hub = hub.clone();
            Box::new(move |usage: &ModelUsage| {
                let mut hub = hub.lock().unwrap();
                let chunk = MessageChunk::Usage {
                    usage: usage.clone(),
                };
                hub.emit(&chunk);
            })
        }),
        on_speed: Some({
            let hub = hub.clone();
            Box::new(move |speed: &ModelSpeed| {
                let mut hub = hub.lock().unwrap();
                let chunk = MessageChunk::Speed {
                    speed: speed.clone(),
                };
                hub.emit(&chunk);
            })
        }),
        on_grounding: Some({
            let hub = hub.clone();
            Box::new(move |grounding: &Value| {
                let mut hub = hub.lock().unwrap();
                let chunk = MessageChunk::Grounding {
                    grounding: grounding.clone(),
                };
                hub.emit(&chunk);
            })
        }),
        on_base64_image: Some({
            let hub = hub.clone();
            Box::new(move |ev: &Base64ImageEvent| {
                let mut hub = hub.lock().unwrap();
                let chunk = MessageChunk::Base64Image(ev.clone());
                hub.emit(&chunk);
            })
        }),
        on_tools_calling: Some({
            let hub = hub.clone();
            let smooth = smooth_tools.clone();
            let handles = handles.clone();
            let smoothed = smoothing.tools_calling;
            Box::new(move |ev: &ToolsCallingEvent| {
                if smoothed {
                    smooth.push_to_queue(&ev.chunk);
                    if smooth.has_inactive_queue() {
                        let drainer = smooth.clone();
                        handles.lock().unwrap().push(tokio::spawn(async move {
                            let speed = drainer.start_speed();
                            drainer.start_animations(speed).await;
                        }));
                    }
                } else {
                    let mut hub = hub.lock().unwrap();
                    let chunk = MessageChunk::ToolCalls {
                        tool_calls: ev.tools_calling.clone(),
                        is_animation_actives: None,
                    };
                    hub.emit(&chunk);
                }
            })
        }),
        ..Default::default()
    };
    let mut decoder = CallbackDecoder::new(callbacks);

    let request = EventSourceRequest {
        url: url.clone(),
        method: options.method.clone(),
        headers: options.headers.clone(),
        body: options.body.clone(),
    };
    let mut client = match options.client.take() {
        Some(c) => c,
        None => EventSourceClient::new_default()?,
    };
    let cancel = options.signal.clone();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let transport = tokio::spawn(async move {
        let mut handler = ChannelHandler { tx };
        let result = client.run(request, &mut handler, &cancel).await;
        (client, result)
    });

    tracing::debug!(%url, "stream opened");
    let mut stream_error: Option<ErrorPayload> = None;
    while let Some(msg) = rx.recv().await {
        process_message(msg, &mut decoder, &hub, &mut options, &mut stream_error);
    }
    let (_client, run_result) = transport
        .await
        .map_err(|e| StreamError::Other(anyhow::anyhow!("transport task failed: {e}")))?;

    let stop_all = || {
        smooth_text.stop_animation();
        smooth_thinking.stop_animation();
        smooth_tools.stop_animations();
    };
    let drain_handles = |handles: &Arc<Mutex<Vec<JoinHandle<()>>>>| {
        std::mem::take(&mut *handles.lock().unwrap())
    };

    let outcome = match run_result {
        Err(e) if e.is_cancellation(&options.cancel_sentinel) => {
            tracing::debug!("stream aborted");
            stop_all();
            for h in drain_handles(&handles) {
                let _ = h.await;
            }
            let text = hub.lock().unwrap().output.clone();
            if let Some(cb) = &mut options.on_abort {
                cb(&text);
            }
            return Ok(FetchOutcome::Abort { text });
        }
        Err(e) => {
            tracing::debug!(error = %e, "stream failed");
            stop_all();
            for h in drain_handles(&handles) {
                let _ = h.await;
            }
            if let Some(cb) = &mut options.on_error_handle {
                cb(&transport_error_payload(&e));
            }
            return Err(e);
        }
        Ok(outcome) => outcome,
    };

    // Successful close with no dispatched message: whole body as one text
    // chunk, so a non-empty response always produces a text callback.
    if let Some(body) = &outcome.undispatched_body {
        decoder.handle(SseMessage {
            id: String::new(),
            event: "text".into(),
            data: Value::String(body.clone()).to_string(),
            retry: None,
        });
    }

    // Force both queues to finish at the catch-up rate before anyone observes
    // the terminal state; nothing buffered is dropped.
    stop_all();
    for h in drain_handles(&handles) {
        let _ = h.await;
    }
    smooth_text.start_animation(catch_up).await;
    smooth_thinking.start_animation(catch_up).await;
    smooth_tools.start_animations(catch_up).await;

    let completion = decoder.finish();
    let header_str = |name: &str| {
        outcome
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };
    let reasoning = completion.thinking.clone().map(|content| Reasoning {
        content,
        signature: completion.thinking_signature.clone(),
    });
    let context = FinishContext {
        finish_type: if stream_error.is_some() {
            FinishType::Error
        } else {
            FinishType::Done
        },
        grounding: completion.grounding.clone(),
        images: decoder.images().to_vec(),
        observation_id: header_str(OBSERVATION_ID_HEADER),
        reasoning,
        speed: completion.speed.clone(),
        tool_calls: completion.tools_calling.clone(),
        trace_id: header_str(TRACE_ID_HEADER),
        usage: completion.usage.clone(),
    };
    tracing::debug!(finish = ?context.finish_type, "stream closed");
    if let Some(cb) = &mut options.on_finish {
        cb(&completion.text, &context);
    }
    Ok(FetchOutcome::Done {
        text: completion.text,
    })
}

fn process_message(
    msg: SseMessage,
    decoder: &mut CallbackDecoder,
    hub: &Arc<Mutex<Hub>>,
    options: &mut FetchSseOptions,
    stream_error: &mut Option<ErrorPayload>,
) {
    if !msg.data.is_empty() && msg.data != crate::sse::DONE_HEARTBEAT {
        match serde_json::from_str::<Value>(&msg.data) {
            Err(e) => {
                // Category-3 recovery: diagnose, skip, keep going.
                if let Some(cb) = &mut options.on_error_handle {
                    cb(&ErrorPayload {
                        body: serde_json::json!({
                            "context": { "chunk": msg.data, "error": e.to_string() },
                        }),
                        message: "parsing stream chunk failed".into(),
                        name: None,
                        error_type: Some("StreamChunkError".into()),
                    });
                }
                return;
            }
            Ok(value) => match msg.event.as_str() {
                "stop" => {
                    if let Value::String(reason) = &value {
                        let mut hub = hub.lock().unwrap();
                        let chunk = MessageChunk::Stop {
                            reason: reason.clone(),
                        };
                        hub.emit(&chunk);
                    }
                }
                "error" => {
                    if let Ok(payload) = serde_json::from_value::<ErrorPayload>(value) {
                        if let Some(cb) = &mut options.on_error_handle {
                            cb(&payload);
                        }
                        *stream_error = Some(payload);
                    }
                    return;
                }
                _ => {}
            },
        }
    }
    decoder.handle(msg);
}

fn transport_error_payload(error: &StreamError) -> ErrorPayload {
    let error_type = match error {
        StreamError::Validation(_) => "ResponseValidationError",
        StreamError::Transport(_) => "TransportError",
        _ => "StreamError",
    };
    ErrorPayload {
        body: Value::Null,
        message: error.to_string(),
        name: None,
        error_type: Some(error_type.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Seen {
        messages: Vec<MessageChunk>,
        finishes: Vec<(String, FinishContext)>,
        errors: Vec<ErrorPayload>,
        aborts: Vec<String>,
    }

    fn recording_options() -> (FetchSseOptions, Arc<Mutex<Seen>>) {
        let seen = Arc::new(Mutex::new(Seen {
            messages: Vec::new(),
            finishes: Vec::new(),
            errors: Vec::new(),
            aborts: Vec::new(),
        }));
        let m = seen.clone();
        let f = seen.clone();
        let e = seen.clone();
        let a = seen.clone();
        let options = FetchSseOptions {
            body: Some(json!({})),
            on_message_handle: Some(Box::new(move |chunk| {
                m.lock().unwrap().messages.push(chunk.clone());
            })),
            on_finish: Some(Box::new(move |text, ctx| {
                f.lock().unwrap().finishes.push((text.into(), ctx.clone()));
            })),
            on_error_handle: Some(Box::new(move |err| {
                e.lock().unwrap().errors.push(err.clone());
            })),
            on_abort: Some(Box::new(move |text| {
                a.lock().unwrap().aborts.push(text.into());
            })),
            ..Default::default()
        };
        (options, seen)
    }

    fn sse_mock(server: &MockServer, body: &str) {
        let body = body.to_string();
        server.mock(move |when, then| {
            when.method(POST).path("/chat");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(body.clone());
        });
    }

    #[tokio::test]
    async fn text_stream_without_smoothing_dispatches_and_finishes() {
        let server = MockServer::start();
        sse_mock(
            &server,
            "event: text\ndata: \"Hello\"\n\nevent: text\ndata: \" World\"\n\nevent: stop\ndata: \"stop\"\n\n",
        );

        let (mut options, seen) = recording_options();
        options.smoothing = false.into();
        let outcome = fetch_sse(format!("{}/chat", server.base_url()), options)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            FetchOutcome::Done {
                text: "Hello World".into()
            }
        );
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.messages,
            vec![
                MessageChunk::Text {
                    text: "Hello".into()
                },
                MessageChunk::Text {
                    text: " World".into()
                },
                MessageChunk::Stop {
                    reason: "stop".into()
                },
            ]
        );
        assert_eq!(seen.finishes.len(), 1);
        let (text, ctx) = &seen.finishes[0];
        assert_eq!(text, "Hello World");
        assert_eq!(ctx.finish_type, FinishType::Done);
        assert_eq!(ctx.usage, None);
        assert_eq!(ctx.tool_calls, None);
        assert!(seen.aborts.is_empty());
        assert!(seen.errors.is_empty());
    }

    #[tokio::test]
    async fn smoothed_text_eventually_plays_everything_out() {
        let server = MockServer::start();
        sse_mock(
            &server,
            "event: text\ndata: \"Hello\"\n\nevent: text\ndata: \" World\"\n\n",
        );

        let (mut options, seen) = recording_options();
        options.smoothing = SmoothingConfig {
            text: true,
            tools_calling: true,
            speed: Some(2),
        };
        let outcome = fetch_sse(format!("{}/chat", server.base_url()), options)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            FetchOutcome::Done {
                text: "Hello World".into()
            }
        );
        let seen = seen.lock().unwrap();
        let played: String = seen
            .messages
            .iter()
            .filter_map(|m| match m {
                MessageChunk::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        // Paced in small slices, but nothing dropped or reordered.
        assert_eq!(played, "Hello World");
        assert!(seen.messages.len() > 2);
        assert_eq!(seen.finishes[0].0, "Hello World");
    }

    #[tokio::test]
    async fn tool_call_fragments_merge_into_finish_payload() {
        let server = MockServer::start();
        sse_mock(
            &server,
            "event: tool_calls\ndata: [{\"index\":0,\"id\":\"call_1\",\"type\":\"function\",\"function\":{\"name\":\"search\",\"arguments\":\"ab\"}}]\n\n\
             event: tool_calls\ndata: [{\"index\":0,\"function\":{\"arguments\":\"cd\"}}]\n\n",
        );

        let (options, seen) = recording_options();
        fetch_sse(format!("{}/chat", server.base_url()), options)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        let tools = seen.finishes[0].1.tool_calls.clone().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].id, "call_1");
        assert_eq!(tools[0].function.name, "search");
        assert_eq!(tools[0].function.arguments, "abcd");
        // Tool smoothing is on by default, so updates carry activity snapshots.
        assert!(seen.messages.iter().any(|m| matches!(
            m,
            MessageChunk::ToolCalls {
                is_animation_actives: Some(_),
                ..
            }
        )));
    }

    #[tokio::test]
    async fn usage_and_speed_dispatch_incrementally() {
        let server = MockServer::start();
        sse_mock(
            &server,
            "event: text\ndata: \"hi\"\n\n\
             event: usage\ndata: {\"totalOutputTokens\":5,\"totalTokens\":10}\n\n\
             event: speed\ndata: {\"tps\":50.0,\"ttft\":120,\"duration\":100,\"latency\":220}\n\n\
             event: stop\ndata: \"stop\"\n\n",
        );

        let (mut options, seen) = recording_options();
        options.smoothing = false.into();
        fetch_sse(format!("{}/chat", server.base_url()), options)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        let usage = ModelUsage {
            total_output_tokens: Some(5),
            total_tokens: 10,
            ..Default::default()
        };
        let speed = ModelSpeed {
            tps: 50.0,
            ttft: 120,
            duration: 100,
            latency: 220,
        };
        assert_eq!(
            seen.messages,
            vec![
                MessageChunk::Text { text: "hi".into() },
                MessageChunk::Usage {
                    usage: usage.clone()
                },
                MessageChunk::Speed {
                    speed: speed.clone()
                },
                MessageChunk::Stop {
                    reason: "stop".into()
                },
            ]
        );
        // Both still land in the finish context as before.
        let ctx = &seen.finishes[0].1;
        assert_eq!(ctx.usage, Some(usage));
        assert_eq!(ctx.speed, Some(speed));
    }

    #[tokio::test]
    async fn reasoning_signature_lands_in_finish_reasoning() {
        let server = MockServer::start();
        sse_mock(
            &server,
            "event: reasoning\ndata: \"deep thought\"\n\n\
             event: reasoning_signature\ndata: \"sig_1\"\n\n\
             event: text\ndata: \"answer\"\n\n",
        );

        let (mut options, seen) = recording_options();
        options.smoothing = false.into();
        fetch_sse(format!("{}/chat", server.base_url()), options)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        let (text, ctx) = &seen.finishes[0];
        assert_eq!(text, "answer");
        assert_eq!(
            ctx.reasoning,
            Some(Reasoning {
                content: "deep thought".into(),
                signature: Some("sig_1".into()),
            })
        );
    }

    #[tokio::test]
    async fn in_stream_error_chunk_finishes_with_error_type() {
        let server = MockServer::start();
        sse_mock(
            &server,
            "event: text\ndata: \"partial\"\n\nevent: error\ndata: {\"body\":null,\"message\":\"upstream exploded\",\"type\":\"ProviderBizError\"}\n\n",
        );

        let (options, seen) = recording_options();
        fetch_sse(format!("{}/chat", server.base_url()), options)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.errors.len(), 1);
        assert_eq!(seen.errors[0].message, "upstream exploded");
        assert_eq!(seen.finishes[0].1.finish_type, FinishType::Error);
        assert_eq!(seen.finishes[0].0, "partial");
    }

    #[tokio::test]
    async fn malformed_chunk_is_diagnosed_and_stream_continues() {
        let server = MockServer::start();
        sse_mock(
            &server,
            "event: text\ndata: \"ok\"\n\nevent: text\ndata: not-json\n\nevent: text\ndata: \"!\"\n\n",
        );

        let (options, seen) = recording_options();
        let outcome = fetch_sse(format!("{}/chat", server.base_url()), options)
            .await
            .unwrap();

        assert_eq!(outcome, FetchOutcome::Done { text: "ok!".into() });
        let seen = seen.lock().unwrap();
        assert_eq!(seen.errors.len(), 1);
        assert_eq!(
            seen.errors[0].error_type.as_deref(),
            Some("StreamChunkError")
        );
        assert_eq!(seen.finishes[0].1.finish_type, FinishType::Done);
    }

    #[tokio::test]
    async fn whole_body_fallback_when_no_message_dispatches() {
        let server = MockServer::start();
        sse_mock(&server, "Hello world");

        let (options, seen) = recording_options();
        let outcome = fetch_sse(format!("{}/chat", server.base_url()), options)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            FetchOutcome::Done {
                text: "Hello world".into()
            }
        );
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.messages,
            vec![MessageChunk::Text {
                text: "Hello world".into()
            }]
        );
    }

    #[tokio::test]
    async fn trace_headers_pass_through_to_finish_context() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/chat");
            then.status(200)
                .header("content-type", "text/event-stream")
                .header(TRACE_ID_HEADER, "trace-123")
                .header(OBSERVATION_ID_HEADER, "obs-456")
                .body("event: text\ndata: \"hi\"\n\n");
        });

        let (mut options, seen) = recording_options();
        options.body = Some(json!({}));
        fetch_sse(format!("{}/chat", server.base_url()), options)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        let ctx = &seen.finishes[0].1;
        assert_eq!(ctx.trace_id.as_deref(), Some("trace-123"));
        assert_eq!(ctx.observation_id.as_deref(), Some("obs-456"));
    }

    #[tokio::test]
    async fn validation_failure_surfaces_error_and_never_finishes() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/chat");
            then.status(500).body("boom");
        });

        let (options, seen) = recording_options();
        let err = fetch_sse(format!("{}/chat", server.base_url()), options)
            .await
            .unwrap_err();

        assert!(matches!(err, StreamError::Validation(_)));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.errors.len(), 1);
        assert_eq!(
            seen.errors[0].error_type.as_deref(),
            Some("ResponseValidationError")
        );
        assert!(seen.finishes.is_empty());
        assert!(seen.aborts.is_empty());
    }

    #[tokio::test]
    async fn pre_cancelled_token_takes_the_abort_path() {
        let server = MockServer::start();
        sse_mock(&server, "event: text\ndata: \"late\"\n\n");

        let (options, seen) = recording_options();
        options.signal.cancel();
        let outcome = fetch_sse(format!("{}/chat", server.base_url()), options)
            .await
            .unwrap();

        assert_eq!(outcome, FetchOutcome::Abort { text: String::new() });
        let seen = seen.lock().unwrap();
        assert_eq!(seen.aborts, vec![String::new()]);
        assert!(seen.finishes.is_empty());
    }

    // Hand-rolled server so the body can pause mid-stream: one text event is
    // flushed, then the connection stays open until the client goes away.
    async fn serve_one_stalled_stream() -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let event = "event: text\ndata: \"Hello\"\n\n";
            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n";
            let frame = format!("{:x}\r\n{}\r\n", event.len(), event);
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(frame.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
            // Hold the stream open; the client cancels first.
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        });
        addr
    }

    #[tokio::test]
    async fn abort_mid_stream_preserves_visible_output_and_skips_finish() {
        let addr = serve_one_stalled_stream().await;

        let (mut options, seen) = recording_options();
        options.smoothing = false.into();
        let signal = options.signal.clone();
        let sink = seen.clone();
        // Cancel as soon as the first text delta becomes visible.
        options.on_message_handle = Some(Box::new(move |chunk| {
            sink.lock().unwrap().messages.push(chunk.clone());
            signal.cancel();
        }));

        let outcome = fetch_sse(format!("http://{addr}/chat"), options)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            FetchOutcome::Abort {
                text: "Hello".into()
            }
        );
        let seen = seen.lock().unwrap();
        assert_eq!(seen.aborts, vec!["Hello".to_string()]);
        assert!(seen.finishes.is_empty());
        assert!(seen.errors.is_empty());
    }
}
