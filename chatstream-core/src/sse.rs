//! Wire-level decoding: byte stream -> lines -> SSE messages / data payloads.
//!
//! `LineStream` reassembles lines that arrive split across network chunks.
//! `SseParser` folds lines into `id`/`event`/`data` triads, dispatching on the
//! blank line. `DataExtractor` keeps only `data:` payloads, dropping the
//! `[DONE]` heartbeat and anything that fails to parse as JSON; a bad payload
//! never aborts the stream.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::stream::Stream;
use serde_json::Value;

use crate::error::{CoreResult, StreamError};

/// Heartbeat sentinel; carries no semantic content and is always discarded.
pub const DONE_HEARTBEAT: &str = "[DONE]";

/// Line splitter over a bytes stream; yields one `String` per `\n`, with the
/// trailing `\n` / `\r\n` removed, and flushes any unterminated tail at end.
pub struct LineStream<S> {
    inner: S,
    buf: Vec<u8>,
    flushed_tail: bool,
}

impl<S> LineStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            flushed_tail: false,
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let idx = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=idx).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

impl<S, E> Stream for LineStream<S>
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    type Item = CoreResult<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(line) = self.take_line() {
                return Poll::Ready(Some(Ok(line)));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.buf.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(StreamError::Transport(e.to_string()))));
                }
                Poll::Ready(None) => {
                    if !self.flushed_tail && !self.buf.is_empty() {
                        self.flushed_tail = true;
                        let tail = std::mem::take(&mut self.buf);
                        return Poll::Ready(Some(Ok(String::from_utf8_lossy(&tail).into_owned())));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// One dispatched server-sent event.
///
/// `id` is empty when the message carried no id field; the transport treats
/// that as an instruction to clear its tracked last-event-id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseMessage {
    pub id: String,
    pub event: String,
    pub data: String,
    pub retry: Option<u64>,
}

/// Incremental SSE field parser. Feed lines in order; a blank line dispatches
/// the accumulated message.
#[derive(Debug, Default)]
pub struct SseParser {
    id: String,
    event: String,
    data: Vec<String>,
    retry: Option<u64>,
    seen_field: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a message when `line` completes one.
    pub fn push_line(&mut self, line: &str) -> Option<SseMessage> {
        if line.is_empty() {
            return self.dispatch();
        }
        // Comment line per the SSE spec.
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };

        self.seen_field = true;
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = value.to_string(),
            "id" => self.id = value.to_string(),
            "retry" => self.retry = value.parse().ok(),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseMessage> {
        if !self.seen_field {
            return None;
        }
        let msg = SseMessage {
            id: std::mem::take(&mut self.id),
            event: std::mem::take(&mut self.event),
            data: std::mem::take(&mut self.data).join("\n"),
            retry: self.retry.take(),
        };
        self.seen_field = false;
        Some(msg)
    }
}

/// Payload of a `data:` line, or `None` for any other line.
pub fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:")
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
}

/// Pulls `data:` payloads out of a line stream and parses each as JSON.
///
/// Non-data lines and the `[DONE]` heartbeat are ignored. A payload that is
/// not valid JSON is dropped with a diagnostic; the stream continues.
pub struct DataExtractor<S> {
    inner: S,
}

impl<S> DataExtractor<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S> Stream for DataExtractor<S>
where
    S: Stream<Item = CoreResult<String>> + Unpin,
{
    type Item = CoreResult<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(line))) => {
                    let Some(payload) = data_payload(&line) else {
                        continue;
                    };
                    if payload.is_empty() || payload == DONE_HEARTBEAT {
                        continue;
                    }
                    match serde_json::from_str::<Value>(payload) {
                        Ok(value) => return Poll::Ready(Some(Ok(value))),
                        Err(e) => {
                            tracing::warn!(error = %e, payload, "dropping unparsable data line");
                            continue;
                        }
                    }
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
