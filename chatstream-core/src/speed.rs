//! Speed annotation: derives timing metrics from a canonical chunk stream.
//!
//! Every chunk passes through unchanged. On the usage-bearing chunk, one
//! synthetic `speed` chunk (id `output_speed`) is appended immediately after.
//! If no usage chunk ever arrives, no speed chunk is emitted.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use futures_util::stream::Stream;

use crate::chunk::{ChunkPayload, ModelSpeed, StreamChunk};

/// Id carried by the synthetic speed chunk.
pub const SPEED_CHUNK_ID: &str = "output_speed";

/// Observes a chunk stream and computes throughput metrics.
///
/// `input_start` must be captured by the caller before the first request byte
/// is sent, so time-to-first-token covers the full round trip.
pub struct TokenSpeedCalculator {
    input_start: Instant,
    first_token_at: Option<Instant>,
}

impl TokenSpeedCalculator {
    pub fn new(input_start: Instant) -> Self {
        Self {
            input_start,
            first_token_at: None,
        }
    }

    /// Feed one chunk. Returns the synthetic speed chunk to emit right after
    /// it, if this was the usage chunk.
    pub fn observe(&mut self, chunk: &StreamChunk) -> Option<StreamChunk> {
        match &chunk.payload {
            ChunkPayload::Text(s) | ChunkPayload::Reasoning(s) => {
                if !s.is_empty() && self.first_token_at.is_none() {
                    self.first_token_at = Some(Instant::now());
                }
                None
            }
            ChunkPayload::Usage(usage) => {
                let now = Instant::now();
                let first = self.first_token_at.unwrap_or(now);
                let ttft = first.duration_since(self.input_start).as_millis() as u64;
                // A zero interval floors to 1ms so tps stays finite.
                let duration = (now.duration_since(first).as_millis() as u64).max(1);
                let latency = now.duration_since(self.input_start).as_millis() as u64;
                let tps = usage.effective_output_tokens() as f64 / (duration as f64 / 1000.0);
                Some(StreamChunk::new(
                    SPEED_CHUNK_ID,
                    ChunkPayload::Speed(ModelSpeed {
                        tps,
                        ttft,
                        duration,
                        latency,
                    }),
                ))
            }
            _ => None,
        }
    }
}

/// Stream adapter wrapping `TokenSpeedCalculator` over a chunk stream.
pub struct SpeedAnnotated<S> {
    inner: S,
    calc: TokenSpeedCalculator,
    pending: Option<StreamChunk>,
}

/// Pass `stream` through unchanged, appending one speed chunk after usage.
pub fn annotate_speed<S>(stream: S, input_start: Instant) -> SpeedAnnotated<S> {
    SpeedAnnotated {
        inner: stream,
        calc: TokenSpeedCalculator::new(input_start),
        pending: None,
    }
}

impl<S> Stream for SpeedAnnotated<S>
where
    S: Stream<Item = StreamChunk> + Unpin,
{
    type Item = StreamChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(speed) = self.pending.take() {
            return Poll::Ready(Some(speed));
        }
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(chunk)) => {
                self.pending = self.calc.observe(&chunk);
                Poll::Ready(Some(chunk))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
