use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use storefront_storage::ThreadId;

/// Observer for incremental reveal. Receives the accumulated prefix, never a delta.
pub type ChunkCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Identifier for one streaming session; changes on every send so stale loops can be stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamSessionId(pub u64);

impl StreamSessionId {
    /// Wraps a raw counter value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// One send into one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub thread_id: ThreadId,
    pub session_id: StreamSessionId,
}

impl StreamTarget {
    /// Pairs a thread with the session streaming into it.
    pub const fn new(thread_id: ThreadId, session_id: StreamSessionId) -> Self {
        Self {
            thread_id,
            session_id,
        }
    }
}

/// Per-thread stream lifecycle. A thread is streaming iff its state is `Streaming`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Streaming(StreamTarget),
    Completed(StreamTarget),
    Cancelled(StreamTarget),
    Failed {
        target: StreamTarget,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransition {
    Start(StreamTarget),
    Complete(StreamTarget),
    Cancel(StreamTarget),
    Fail {
        target: StreamTarget,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    /// Another session owns the thread; it has to be cancelled first.
    AlreadyStreaming {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    NoActiveStream,
    /// A terminal signal from a session that was already replaced.
    SessionMismatch {
        active: StreamTarget,
        attempted: StreamTarget,
    },
}

pub type StreamTransitionResult = Result<StreamState, StreamTransitionRejection>;

impl StreamState {
    /// The session currently allowed to reveal text, if any.
    pub fn active_target(&self) -> Option<StreamTarget> {
        match self {
            Self::Streaming(target) => Some(*target),
            Self::Idle | Self::Completed(_) | Self::Cancelled(_) | Self::Failed { .. } => None,
        }
    }

    /// Only `Streaming` counts; terminal states do not.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming(_))
    }

    /// Short status label for listings.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Streaming(_) => "streaming",
            Self::Completed(_) => "completed",
            Self::Cancelled(_) => "stopped",
            Self::Failed { .. } => "failed",
        }
    }

    /// Starting is allowed from any non-streaming state; terminal transitions must name
    /// the active session exactly.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Start(target) => self.apply_start(target),
            StreamTransition::Complete(target) => {
                self.apply_terminal(target, || Self::Completed(target))
            }
            StreamTransition::Cancel(target) => {
                self.apply_terminal(target, || Self::Cancelled(target))
            }
            StreamTransition::Fail { target, message } => {
                self.apply_terminal(target, || Self::Failed { target, message })
            }
        }
    }

    fn apply_start(&self, target: StreamTarget) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active != target => {
                Err(StreamTransitionRejection::AlreadyStreaming {
                    active: *active,
                    attempted: target,
                })
            }
            Self::Streaming(_) => Ok(self.clone()),
            Self::Idle | Self::Completed(_) | Self::Cancelled(_) | Self::Failed { .. } => {
                Ok(Self::Streaming(target))
            }
        }
    }

    fn apply_terminal(
        &self,
        target: StreamTarget,
        next: impl FnOnce() -> Self,
    ) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active == target => Ok(next()),
            Self::Streaming(active) => Err(StreamTransitionRejection::SessionMismatch {
                active: *active,
                attempted: target,
            }),
            Self::Idle | Self::Completed(_) | Self::Cancelled(_) | Self::Failed { .. } => {
                Err(StreamTransitionRejection::NoActiveStream)
            }
        }
    }
}

/// Bounds of the random pause between revealed words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDelay {
    pub min: Duration,
    pub max: Duration,
}

impl Default for StreamDelay {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(15),
            max: Duration::from_millis(40),
        }
    }
}

impl StreamDelay {
    /// Pause bounds per revealed word; swapped when given out of order.
    pub fn new(min: Duration, max: Duration) -> Self {
        if max < min {
            Self { min: max, max: min }
        } else {
            Self { min, max }
        }
    }

    /// Uniform pick within the bounds.
    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let min_ms = self.min.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
    }
}

/// How one reveal loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    /// Stopped early; `revealed` is what observers had already been shown.
    Cancelled { revealed: String },
}

#[derive(Default)]
struct SessionTable {
    states: HashMap<ThreadId, StreamState>,
    // Only threads in `Streaming` hold an entry.
    callbacks: HashMap<ThreadId, ChunkCallback>,
    next_session_id: u64,
}

impl SessionTable {
    fn state(&self, thread_id: ThreadId) -> StreamState {
        self.states.get(&thread_id).cloned().unwrap_or_default()
    }

    fn active_target(&self, thread_id: ThreadId) -> Option<StreamTarget> {
        self.states
            .get(&thread_id)
            .and_then(StreamState::active_target)
    }

    fn streaming_threads(&self) -> Vec<ThreadId> {
        let mut threads = self
            .states
            .iter()
            .filter(|(_, state)| state.is_streaming())
            .map(|(thread_id, _)| *thread_id)
            .collect::<Vec<_>>();
        threads.sort();
        threads
    }

    fn transition(&mut self, thread_id: ThreadId, transition: StreamTransition) -> bool {
        match self.state(thread_id).apply(transition) {
            Ok(next) => {
                if !next.is_streaming() {
                    self.callbacks.remove(&thread_id);
                }
                self.states.insert(thread_id, next);
                true
            }
            Err(rejection) => {
                tracing::debug!(
                    thread_id = %thread_id,
                    ?rejection,
                    "ignored stale stream transition"
                );
                false
            }
        }
    }

    fn cancel_active(&mut self, thread_id: ThreadId) -> bool {
        match self.active_target(thread_id) {
            Some(active) => self.transition(thread_id, StreamTransition::Cancel(active)),
            None => false,
        }
    }
}

/// Session table for incremental response reveal.
///
/// Cloning shares the table. Each thread's [`StreamState`] decides whether it is streaming
/// and which session may still reveal text.
#[derive(Clone, Default)]
pub struct StreamingDispatcher {
    table: Arc<Mutex<SessionTable>>,
    delay: StreamDelay,
}

impl fmt::Debug for StreamingDispatcher {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("StreamingDispatcher")
            .field("delay", &self.delay)
            .field("active_sessions", &self.table.lock().streaming_threads().len())
            .finish()
    }
}

impl StreamingDispatcher {
    /// Empty table; every reveal step waits a random pause within `delay`.
    pub fn new(delay: StreamDelay) -> Self {
        Self {
            table: Arc::new(Mutex::new(SessionTable::default())),
            delay,
        }
    }

    /// Pause bounds this dispatcher was built with.
    pub fn delay(&self) -> StreamDelay {
        self.delay
    }

    /// Opens a session for the thread, replacing (and thereby stopping) any older one.
    /// The session ends when the returned guard drops.
    pub fn begin(&self, thread_id: ThreadId, callback: Option<ChunkCallback>) -> StreamSession {
        let mut table = self.table.lock();
        table.next_session_id += 1;
        let target = StreamTarget::new(thread_id, StreamSessionId::new(table.next_session_id));

        if let Err(StreamTransitionRejection::AlreadyStreaming { active, .. }) =
            table.state(thread_id).apply(StreamTransition::Start(target))
        {
            table.transition(thread_id, StreamTransition::Cancel(active));
            tracing::debug!(thread_id = %thread_id, "replaced in-flight stream session");
        }
        table.transition(thread_id, StreamTransition::Start(target));
        if let Some(callback) = callback {
            table.callbacks.insert(thread_id, callback);
        }

        StreamSession {
            dispatcher: self.clone(),
            target,
        }
    }

    /// Attaches an observer to an in-flight stream. Returns `false` if the thread is not
    /// streaming, in which case nothing is registered.
    pub fn register_streaming_callback(&self, thread_id: ThreadId, callback: ChunkCallback) -> bool {
        let mut table = self.table.lock();
        if table.active_target(thread_id).is_none() {
            return false;
        }
        table.callbacks.insert(thread_id, callback);
        true
    }

    /// Detaches the observer; the stream keeps running and later chunks are dropped.
    pub fn unregister_streaming_callback(&self, thread_id: ThreadId) {
        self.table.lock().callbacks.remove(&thread_id);
    }

    /// True while the thread's state is `Streaming`.
    pub fn is_streaming(&self, thread_id: ThreadId) -> bool {
        self.table.lock().active_target(thread_id).is_some()
    }

    /// Threads currently streaming, in id order.
    pub fn active_threads(&self) -> Vec<ThreadId> {
        self.table.lock().streaming_threads()
    }

    /// Last known lifecycle state; `Idle` for threads that never streamed.
    pub fn stream_state(&self, thread_id: ThreadId) -> StreamState {
        self.table.lock().state(thread_id)
    }

    /// Stops every active stream and clears the registry. Returns how many were stopped.
    pub fn stop_streaming(&self) -> usize {
        let mut table = self.table.lock();
        let threads = table.streaming_threads();
        for thread_id in &threads {
            table.cancel_active(*thread_id);
        }
        if !threads.is_empty() {
            tracing::info!(stopped = threads.len(), "stopped all active streams");
        }
        threads.len()
    }

    /// Stops only this thread's stream.
    pub fn stop_thread(&self, thread_id: ThreadId) -> bool {
        let stopped = self.table.lock().cancel_active(thread_id);
        if stopped {
            tracing::info!(thread_id = %thread_id, "stopped stream");
        }
        stopped
    }

    /// Drops every trace of the thread, including its last terminal state.
    pub fn forget(&self, thread_id: ThreadId) {
        let mut table = self.table.lock();
        table.states.remove(&thread_id);
        table.callbacks.remove(&thread_id);
    }

    pub(crate) fn mark_failed(&self, target: StreamTarget, message: impl Into<String>) {
        self.table.lock().transition(
            target.thread_id,
            StreamTransition::Fail {
                target,
                message: message.into(),
            },
        );
    }

    /// Reveals `text` word by word to the session's observer.
    ///
    /// Before each word the session must still be the thread's active one; otherwise the
    /// loop exits without emitting anything further.
    pub async fn reveal(&self, target: StreamTarget, text: &str) -> StreamOutcome {
        let mut revealed_end = 0;

        for word_end in word_ends(text) {
            let Some(callback) = self.step_gate(target) else {
                tracing::debug!(
                    thread_id = %target.thread_id,
                    revealed_bytes = revealed_end,
                    "stream stopped before completion"
                );
                return StreamOutcome::Cancelled {
                    revealed: text[..revealed_end].to_string(),
                };
            };

            revealed_end = word_end;
            if let Some(callback) = callback {
                callback(&text[..word_end]);
            }

            tokio::time::sleep(self.delay.sample()).await;
        }

        self.table
            .lock()
            .transition(target.thread_id, StreamTransition::Complete(target));
        StreamOutcome::Completed
    }

    // `None` means stop; `Some(None)` means keep going with nobody listening.
    fn step_gate(&self, target: StreamTarget) -> Option<Option<ChunkCallback>> {
        let table = self.table.lock();
        (table.active_target(target.thread_id) == Some(target))
            .then(|| table.callbacks.get(&target.thread_id).cloned())
    }

    // A guard dropped while its session still streams means the send was abandoned.
    fn finish(&self, target: StreamTarget) {
        let mut table = self.table.lock();
        if table.active_target(target.thread_id) == Some(target) {
            table.transition(target.thread_id, StreamTransition::Cancel(target));
        }
    }
}

/// Live streaming session. Dropping it before the reveal finishes cancels the session.
pub struct StreamSession {
    dispatcher: StreamingDispatcher,
    target: StreamTarget,
}

impl StreamSession {
    /// Thread and session id this guard owns.
    pub fn target(&self) -> StreamTarget {
        self.target
    }

    pub fn thread_id(&self) -> ThreadId {
        self.target.thread_id
    }

    /// See [`StreamingDispatcher::reveal`].
    pub async fn reveal(&self, text: &str) -> StreamOutcome {
        self.dispatcher.reveal(self.target, text).await
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.dispatcher.finish(self.target);
    }
}

/// Byte offsets just past each whitespace-delimited word.
fn word_ends(text: &str) -> Vec<usize> {
    let mut ends = Vec::new();
    let mut in_word = false;

    for (index, character) in text.char_indices() {
        if character.is_whitespace() {
            if in_word {
                ends.push(index);
            }
            in_word = false;
        } else {
            in_word = true;
        }
    }

    if in_word {
        ends.push(text.len());
    }
    ends
}
