//! Smoothing schedulers: pace the visible delivery of already-received data.
//!
//! Incoming deltas are queued as individual characters and drained a fixed
//! number of units per scheduler tick, so arrival bursts do not appear as an
//! instantaneous jump. Two presets exist: a slow "live typing" rate used while
//! the stream is arriving, and a faster catch-up rate used once the network is
//! done but the queue is not yet empty.
//!
//! `stop_animation` halts draining without clearing undrained content;
//! `start_animation` resolves once the queue empties. Both are safe to call
//! at any time from the orchestrator's cancellation path.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::chunk::{ToolCall, ToolCallChunk};

/// Units drained per tick while the stream is still arriving.
pub const START_ANIMATION_SPEED: usize = 10;
/// Units drained per tick when catching up after the stream has finished.
pub const CATCH_UP_ANIMATION_SPEED: usize = 16;
/// Scheduler tick cadence.
pub const ANIMATION_TICK: Duration = Duration::from_millis(16);

pub type TextUpdateFn = Arc<dyn Fn(&str, &str) + Send + Sync>;

struct TextState {
    queue: VecDeque<char>,
    buffer: String,
    active: bool,
}

/// Character-FIFO scheduler for text-bearing deltas.
///
/// Clones share the same queue and animation state, so one clone can drain in
/// a spawned task while another pushes from the network loop.
#[derive(Clone)]
pub struct SmoothText {
    state: Arc<Mutex<TextState>>,
    on_update: TextUpdateFn,
    start_speed: usize,
}

impl SmoothText {
    /// `on_update` receives `(delta-just-drained, full-buffer-so-far)`.
    pub fn new(on_update: TextUpdateFn, start_speed: Option<usize>) -> Self {
        Self {
            state: Arc::new(Mutex::new(TextState {
                queue: VecDeque::new(),
                buffer: String::new(),
                active: false,
            })),
            on_update,
            start_speed: start_speed.unwrap_or(START_ANIMATION_SPEED),
        }
    }

    pub fn push_to_queue(&self, text: &str) {
        let mut st = self.state.lock().unwrap();
        st.queue.extend(text.chars());
    }

    pub fn is_animation_active(&self) -> bool {
        self.state.lock().unwrap().active
    }

    pub fn is_token_remain(&self) -> bool {
        !self.state.lock().unwrap().queue.is_empty()
    }

    pub fn start_speed(&self) -> usize {
        self.start_speed
    }

    /// Halt draining at the next tick. Undrained content stays queued and the
    /// update callback is not invoked again. Idempotent.
    pub fn stop_animation(&self) {
        self.state.lock().unwrap().active = false;
    }

    /// Drain `speed` characters per tick until the queue empties, invoking the
    /// update callback with each drained delta. Resolves immediately if an
    /// animation is already running.
    pub async fn start_animation(&self, speed: usize) {
        {
            let mut st = self.state.lock().unwrap();
            if st.active {
                return;
            }
            st.active = true;
        }
        let speed = speed.max(1);
        let mut ticker = tokio::time::interval(ANIMATION_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let (delta, buffer, done) = {
                let mut st = self.state.lock().unwrap();
                if !st.active {
                    return;
                }
                let n = speed.min(st.queue.len());
                let delta: String = st.queue.drain(..n).collect();
                st.buffer.push_str(&delta);
                let done = st.queue.is_empty();
                if done {
                    st.active = false;
                }
                (delta, st.buffer.clone(), done)
            };
            if !delta.is_empty() {
                (self.on_update)(&delta, &buffer);
            }
            if done {
                return;
            }
        }
    }
}

pub type ToolCallsUpdateFn = Arc<dyn Fn(&[ToolCall], &[bool]) + Send + Sync>;

struct ToolState {
    buffer: Vec<ToolCall>,
    queues: Vec<VecDeque<char>>,
    actives: Vec<bool>,
    seeded: Vec<bool>,
}

impl ToolState {
    fn grow_to(&mut self, index: usize) {
        if self.buffer.len() <= index {
            self.buffer.resize_with(index + 1, ToolCall::default);
            self.queues.resize_with(index + 1, VecDeque::new);
            self.actives.resize(index + 1, false);
            self.seeded.resize(index + 1, false);
        }
    }
}

/// Per-tool-call-index scheduler. Each index owns an independent queue and
/// animation state; draining index `i` only mutates tool call `i`'s
/// accumulated arguments string.
#[derive(Clone)]
pub struct SmoothToolCalls {
    state: Arc<Mutex<ToolState>>,
    on_update: ToolCallsUpdateFn,
    start_speed: usize,
}

impl SmoothToolCalls {
    /// `on_update` receives the merged calls and a per-index activity snapshot.
    pub fn new(on_update: ToolCallsUpdateFn, start_speed: Option<usize>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ToolState {
                buffer: Vec::new(),
                queues: Vec::new(),
                actives: Vec::new(),
                seeded: Vec::new(),
            })),
            on_update,
            start_speed: start_speed.unwrap_or(START_ANIMATION_SPEED),
        }
    }

    /// Queue each fragment's argument characters under its index, seeding the
    /// merged call (id/type/name, empty arguments) from the first fragment.
    pub fn push_to_queue(&self, fragments: &[ToolCallChunk]) {
        let mut st = self.state.lock().unwrap();
        for chunk in fragments {
            st.grow_to(chunk.index);
            if !st.seeded[chunk.index] {
                st.buffer[chunk.index] = ToolCall::seed(chunk);
                st.seeded[chunk.index] = true;
            }
            let args: Vec<char> = chunk.function.arguments.chars().collect();
            st.queues[chunk.index].extend(args);
        }
    }

    pub fn is_token_remain(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .queues
            .iter()
            .any(|q| !q.is_empty())
    }

    pub fn start_speed(&self) -> usize {
        self.start_speed
    }

    pub fn has_inactive_queue(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.queues
            .iter()
            .zip(&st.actives)
            .any(|(q, active)| !q.is_empty() && !active)
    }

    /// Current merged calls snapshot.
    pub fn tools_calling(&self) -> Vec<ToolCall> {
        self.state.lock().unwrap().buffer.clone()
    }

    pub fn stop_animations(&self) {
        let mut st = self.state.lock().unwrap();
        for active in &mut st.actives {
            *active = false;
        }
    }

    /// Drain one index at `speed` characters per tick until its queue empties.
    pub async fn start_animation(&self, index: usize, speed: usize) {
        {
            let mut st = self.state.lock().unwrap();
            if index >= st.actives.len() || st.actives[index] {
                return;
            }
            st.actives[index] = true;
        }
        let speed = speed.max(1);
        let mut ticker = tokio::time::interval(ANIMATION_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let (snapshot, done) = {
                let mut st = self.state.lock().unwrap();
                if !st.actives[index] {
                    return;
                }
                let n = speed.min(st.queues[index].len());
                let delta: String = st.queues[index].drain(..n).collect();
                st.buffer[index].function.arguments.push_str(&delta);
                let done = st.queues[index].is_empty();
                if done {
                    st.actives[index] = false;
                }
                let snapshot = (!delta.is_empty())
                    .then(|| (st.buffer.clone(), st.actives.clone()));
                (snapshot, done)
            };
            if let Some((buffer, actives)) = snapshot {
                (self.on_update)(&buffer, &actives);
            }
            if done {
                return;
            }
        }
    }

    /// Drain every index with queued content concurrently; resolves when all
    /// drained queues are empty.
    pub async fn start_animations(&self, speed: usize) {
        let pending: Vec<usize> = {
            let st = self.state.lock().unwrap();
            (0..st.queues.len())
                .filter(|i| !st.queues[*i].is_empty() && !st.actives[*i])
                .collect()
        };
        let pools = pending.into_iter().map(|i| self.start_animation(i, speed));
        futures::future::join_all(pools).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::FunctionCallChunk;

    fn fragment(index: usize, name: Option<&str>, args: &str) -> ToolCallChunk {
        ToolCallChunk {
            index,
            id: name.map(|n| format!("call_{n}")),
            call_type: Some("function".into()),
            function: FunctionCallChunk {
                name: name.map(String::from),
                arguments: args.into(),
            },
        }
    }

    #[test]
    fn start_speed_defaults_to_the_live_typing_preset() {
        let text = SmoothText::new(Arc::new(|_: &str, _: &str| {}), None);
        let tools = SmoothToolCalls::new(Arc::new(|_: &[ToolCall], _: &[bool]| {}), None);
        assert_eq!(text.start_speed(), START_ANIMATION_SPEED);
        assert_eq!(tools.start_speed(), START_ANIMATION_SPEED);

        let fixed = SmoothToolCalls::new(Arc::new(|_: &[ToolCall], _: &[bool]| {}), Some(4));
        assert_eq!(fixed.start_speed(), 4);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn drains_in_tick_sized_slices() {
        let deltas = Arc::new(Mutex::new(Vec::new()));
        let sink = deltas.clone();
        let smooth = SmoothText::new(
            Arc::new(move |delta: &str, _buffer: &str| {
                sink.lock().unwrap().push(delta.to_string());
            }),
            None,
        );

        smooth.push_to_queue("Hello World");
        smooth.start_animation(4).await;

        let deltas = deltas.lock().unwrap();
        assert_eq!(deltas.concat(), "Hello World");
        assert!(deltas.len() >= 3);
        assert!(deltas.iter().all(|d| d.chars().count() <= 4));
        assert!(!smooth.is_animation_active());
        assert!(!smooth.is_token_remain());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn stop_is_idempotent_on_empty_queue() {
        let calls = Arc::new(Mutex::new(0usize));
        let sink = calls.clone();
        let smooth = SmoothText::new(
            Arc::new(move |_: &str, _: &str| {
                *sink.lock().unwrap() += 1;
            }),
            None,
        );

        smooth.stop_animation();
        smooth.stop_animation();
        assert_eq!(*calls.lock().unwrap(), 0);
        assert!(!smooth.is_animation_active());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn stop_halts_without_clearing_queue() {
        let smooth = SmoothText::new(Arc::new(|_: &str, _: &str| {}), None);
        smooth.push_to_queue(&"x".repeat(100));

        let drainer = smooth.clone();
        let handle = tokio::spawn(async move { drainer.start_animation(1).await });

        tokio::time::sleep(ANIMATION_TICK * 3).await;
        smooth.stop_animation();
        handle.await.unwrap();

        assert!(smooth.is_token_remain());
        assert!(!smooth.is_animation_active());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn start_is_a_noop_while_already_active() {
        let smooth = SmoothText::new(Arc::new(|_: &str, _: &str| {}), None);
        smooth.push_to_queue("abcdef");

        let drainer = smooth.clone();
        let handle = tokio::spawn(async move { drainer.start_animation(1).await });
        tokio::time::sleep(ANIMATION_TICK).await;
        // Second start returns immediately instead of double-draining.
        smooth.start_animation(1000).await;
        smooth.stop_animation();
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn tool_call_indices_drain_independently() {
        let smooth = SmoothToolCalls::new(Arc::new(|_: &[ToolCall], _: &[bool]| {}), None);
        smooth.push_to_queue(&[
            fragment(0, Some("alpha"), "{\"a\":1}"),
            fragment(1, Some("beta"), "{\"b\":2}"),
        ]);
        smooth.push_to_queue(&[fragment(0, None, " extra")]);

        smooth.start_animations(CATCH_UP_ANIMATION_SPEED).await;

        let calls = smooth.tools_calling();
        assert_eq!(calls[0].function.name, "alpha");
        assert_eq!(calls[0].function.arguments, "{\"a\":1} extra");
        assert_eq!(calls[1].function.name, "beta");
        assert_eq!(calls[1].function.arguments, "{\"b\":2}");
        assert!(!smooth.is_token_remain());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn seed_keeps_first_seen_identity() {
        let smooth = SmoothToolCalls::new(Arc::new(|_: &[ToolCall], _: &[bool]| {}), None);
        smooth.push_to_queue(&[fragment(0, Some("first"), "ab")]);
        smooth.push_to_queue(&[fragment(0, Some("second"), "cd")]);

        smooth.start_animations(CATCH_UP_ANIMATION_SPEED).await;

        let calls = smooth.tools_calling();
        assert_eq!(calls[0].id, "call_first");
        assert_eq!(calls[0].function.name, "first");
        assert_eq!(calls[0].function.arguments, "abcd");
    }
}
