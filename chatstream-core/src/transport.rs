//! Low-level event-source transport: one request, one decoded SSE session.
//!
//! The client validates the response through the handler's `on_open` hook
//! before consuming the body, then drives `LineStream` -> `SseParser` and
//! dispatches each assembled message. It tracks the last event id across
//! calls so a caller-implemented reconnect loop can resume; a message whose
//! id field is absent clears the tracked value instead of reusing a stale
//! one. `on_error` may return a "retry after N ms" hint for the caller's
//! retry loop; this component never retries on its own.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::config::HttpCfg;
use crate::error::{CoreResult, StreamError};
use crate::sse::{LineStream, SseMessage, SseParser};

/// MIME type the default open-validation accepts.
pub const EVENT_STREAM_MIME: &str = "text/event-stream";

/// Default response validation: 2xx status and an event-stream content type.
pub async fn default_on_open(response: &reqwest::Response) -> CoreResult<()> {
    let status = response.status();
    if !status.is_success() {
        return Err(StreamError::Validation(format!(
            "unexpected status {status}"
        )));
    }
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with(EVENT_STREAM_MIME) {
        return Err(StreamError::Validation(format!(
            "expected {EVENT_STREAM_MIME}, got {content_type:?}"
        )));
    }
    Ok(())
}

/// Hooks driven by [`EventSourceClient::run`].
#[async_trait]
pub trait EventSourceHandler: Send {
    /// Validate the response before its body is consumed. An error here is
    /// propagated to `on_error` and ends the session without reading the body.
    async fn on_open(&mut self, response: &reqwest::Response) -> CoreResult<()> {
        default_on_open(response).await
    }

    fn on_message(&mut self, message: SseMessage);

    /// A numeric return value means "retry after N ms" to whatever loop owns
    /// this handler. The client itself ignores it.
    fn on_error(&mut self, _error: &StreamError) -> Option<u64> {
        None
    }

    fn on_close(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct EventSourceRequest {
    pub url: String,
    pub method: http::Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl EventSourceRequest {
    pub fn post(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            url: url.into(),
            method: http::Method::POST,
            headers: Vec::new(),
            body: Some(body),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: http::Method::GET,
            headers: Vec::new(),
            body: None,
        }
    }
}

/// What the caller gets back after a session that reached the body phase.
#[derive(Debug)]
pub struct EventSourceOutcome {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Full body text, present only when no message was ever dispatched.
    /// Lets the orchestrator fall back to whole-body-as-one-text-chunk.
    pub undispatched_body: Option<String>,
    /// Last `retry:` field seen on the wire, if any.
    pub retry_after: Option<u64>,
}

/// Thin wrapper around `reqwest::Client` for SSE sessions.
#[derive(Debug, Clone)]
pub struct EventSourceClient {
    http: reqwest::Client,
    last_event_id: Option<String>,
}

impl EventSourceClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            last_event_id: None,
        }
    }

    pub fn new_default() -> CoreResult<Self> {
        Self::from_config(&HttpCfg::default())
    }

    pub fn from_config(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(std::time::Duration::from_millis(cfg.request_timeout_ms));
        if let Some(max) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(max);
        }
        let http = builder
            .build()
            .map_err(|e| StreamError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self::new(http))
    }

    /// Tracked id for reconnection, updated per dispatched message.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Issue one request and pump its body through the handler until the
    /// stream ends, an error occurs, or `cancel` fires. Cancellation is
    /// surfaced as `StreamError::Cancelled` through `on_error` and the return
    /// value; the handler's owner decides whether that is an abort.
    pub async fn run(
        &mut self,
        request: EventSourceRequest,
        handler: &mut (dyn EventSourceHandler + Send),
        cancel: &CancellationToken,
    ) -> CoreResult<EventSourceOutcome> {
        let mut builder = self
            .http
            .request(request.method.clone(), &request.url)
            .header(ACCEPT, EVENT_STREAM_MIME)
            .header(CACHE_CONTROL, "no-cache");
        for (k, v) in &request.headers {
            builder = builder.header(k, v);
        }
        if let Some(id) = &self.last_event_id {
            builder = builder.header("Last-Event-ID", id);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                let e = StreamError::Cancelled;
                handler.on_error(&e);
                return Err(e);
            }
            sent = builder.send() => match sent {
                Ok(r) => r,
                Err(e) => {
                    let e = StreamError::Transport(e.to_string());
                    handler.on_error(&e);
                    return Err(e);
                }
            }
        };

        if let Err(e) = handler.on_open(&response).await {
            handler.on_error(&e);
            return Err(e);
        }

        let status = response.status();
        let headers = response.headers().clone();
        let mut lines = LineStream::new(Box::pin(response.bytes_stream()));
        let mut parser = SseParser::new();
        let mut dispatched = false;
        let mut raw = String::new();
        let mut retry_after = None;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    let e = StreamError::Cancelled;
                    handler.on_error(&e);
                    return Err(e);
                }
                item = lines.next() => item,
            };
            match next {
                Some(Ok(line)) => {
                    if !dispatched {
                        if !raw.is_empty() {
                            raw.push('\n');
                        }
                        raw.push_str(&line);
                    }
                    if let Some(msg) = parser.push_line(&line) {
                        if let Some(retry) = msg.retry {
                            retry_after = Some(retry);
                        }
                        self.last_event_id =
                            (!msg.id.is_empty()).then(|| msg.id.clone());
                        dispatched = true;
                        raw.clear();
                        handler.on_message(msg);
                    }
                }
                Some(Err(e)) => {
                    handler.on_error(&e);
                    return Err(e);
                }
                None => break,
            }
        }

        handler.on_close();
        Ok(EventSourceOutcome {
            status,
            headers,
            undispatched_body: (!dispatched && !raw.is_empty()).then_some(raw),
            retry_after,
        })
    }
}
