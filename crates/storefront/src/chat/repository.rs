use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use snafu::OptionExt;
use storefront_llm::{GenerateRequest, ResponseGenerator};
use storefront_storage::{KeyValueStore, MessageId, ThreadId};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::error::{
    ChatError, ChatResult, MessageNotEditableSnafu, MessageNotFoundSnafu, NoCurrentThreadSnafu,
    ReplySupersededSnafu, StreamCancelledSnafu, ThreadNotFoundSnafu,
};
use super::events::ThreadEvent;
use super::message::{ChatMessage, ChatThread, Role};
use super::stream::{ChunkCallback, StreamOutcome, StreamState, StreamingDispatcher};

pub const THREADS_KEY: &str = "storefront.chat.threads";
pub const CURRENT_THREAD_KEY: &str = "storefront.chat.current_thread";

const EVENT_CAPACITY: usize = 64;

/// Raw stored values this repository last wrote or read.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct StoredSnapshot {
    threads: Option<String>,
    current: Option<String>,
}

#[derive(Debug, Default)]
struct ThreadState {
    threads: Vec<ChatThread>,
    current: Option<ThreadId>,
    snapshot: StoredSnapshot,
}

impl ThreadState {
    fn thread(&self, thread_id: ThreadId) -> Option<&ChatThread> {
        self.threads.iter().find(|thread| thread.id == thread_id)
    }

    fn thread_mut(&mut self, thread_id: ThreadId) -> Option<&mut ChatThread> {
        self.threads.iter_mut().find(|thread| thread.id == thread_id)
    }

    fn resolve(&self, thread_id: Option<ThreadId>, stage: &'static str) -> ChatResult<ThreadId> {
        let thread_id = match thread_id {
            Some(thread_id) => thread_id,
            None => self.current.context(NoCurrentThreadSnafu { stage })?,
        };
        if self.thread(thread_id).is_none() {
            return ThreadNotFoundSnafu { stage, thread_id }.fail();
        }
        Ok(thread_id)
    }
}

/// Owner of every chat thread and of the current-thread pointer.
///
/// Each mutation writes the whole collection back to the store before returning.
/// Store failures are logged and absorbed; the in-memory collection stays authoritative.
/// [`ThreadRepository::watch_store`] keeps several holders of one store in step.
pub struct ThreadRepository {
    store: Arc<dyn KeyValueStore>,
    state: Mutex<ThreadState>,
    dispatcher: StreamingDispatcher,
    generator: Arc<dyn ResponseGenerator>,
    events: broadcast::Sender<ThreadEvent>,
}

impl ThreadRepository {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        generator: Arc<dyn ResponseGenerator>,
        dispatcher: StreamingDispatcher,
    ) -> Self {
        let state = load_state(store.as_ref());
        tracing::debug!(
            threads = state.threads.len(),
            has_current = state.current.is_some(),
            "loaded chat threads"
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            store,
            state: Mutex::new(state),
            dispatcher,
            generator,
            events,
        }
    }

    pub fn dispatcher(&self) -> &StreamingDispatcher {
        &self.dispatcher
    }

    /// Repository events; see [`ThreadEvent`].
    pub fn subscribe(&self) -> broadcast::Receiver<ThreadEvent> {
        self.events.subscribe()
    }

    /// Always creates a fresh thread and makes it current.
    pub fn create_thread(
        &self,
        assistant_id: impl Into<String>,
        assistant_name: impl Into<String>,
    ) -> ThreadId {
        let thread = ChatThread::new(assistant_id, assistant_name);
        let thread_id = thread.id;
        tracing::info!(
            thread_id = %thread_id,
            assistant_id = %thread.assistant_id,
            remote = thread.assistant.is_remote(),
            "created chat thread"
        );

        {
            let mut state = self.state.lock();
            state.threads.push(thread);
            state.current = Some(thread_id);
            self.persist_locked(&mut state);
        }

        self.emit(ThreadEvent::Created(thread_id));
        self.emit(ThreadEvent::CurrentChanged(Some(thread_id)));
        thread_id
    }

    /// Snapshot of one thread.
    pub fn get_thread(&self, thread_id: ThreadId) -> Option<ChatThread> {
        self.state.lock().thread(thread_id).cloned()
    }

    pub fn get_current_thread(&self) -> Option<ChatThread> {
        let state = self.state.lock();
        state
            .current
            .and_then(|thread_id| state.thread(thread_id))
            .cloned()
    }

    pub fn current_thread_id(&self) -> Option<ThreadId> {
        self.state.lock().current
    }

    /// Newest activity first.
    pub fn get_all_threads(&self) -> Vec<ChatThread> {
        let mut threads = self.state.lock().threads.clone();
        threads.sort_by(|left, right| {
            right
                .updated_at
                .cmp(&left.updated_at)
                .then_with(|| right.id.cmp(&left.id))
        });
        threads
    }

    /// Unknown ids leave the pointer untouched and return `false`.
    pub fn set_current_thread(&self, thread_id: ThreadId) -> bool {
        {
            let mut state = self.state.lock();
            if state.thread(thread_id).is_none() {
                tracing::debug!(thread_id = %thread_id, "ignored switch to unknown thread");
                return false;
            }
            if state.current == Some(thread_id) {
                return true;
            }
            state.current = Some(thread_id);
            self.persist_locked(&mut state);
        }

        self.emit(ThreadEvent::CurrentChanged(Some(thread_id)));
        true
    }

    /// Replaces the stored thread with the same id. The caller owns `updated_at`.
    pub fn update_thread(&self, thread: ChatThread) -> ChatResult<()> {
        let thread_id = thread.id;
        self.mutate_thread(thread_id, "update-thread", move |slot| *slot = thread)
    }

    pub fn pin_thread(&self, thread_id: ThreadId, pinned: bool) -> ChatResult<()> {
        self.mutate_thread(thread_id, "pin-thread", |thread| {
            thread.is_pinned = pinned;
            thread.touch();
        })
    }

    /// Leaves `updated_at` alone so renaming never reorders the list.
    /// A blank title clears the custom title.
    pub fn rename_thread(&self, thread_id: ThreadId, title: &str) -> ChatResult<()> {
        let title = title.trim();
        let custom_title = (!title.is_empty()).then(|| title.to_string());
        self.mutate_thread(thread_id, "rename-thread", |thread| {
            thread.custom_title = custom_title;
        })
    }

    /// Returns `false` when the id was unknown.
    pub fn delete_thread(&self, thread_id: ThreadId) -> bool {
        let cleared_current = {
            let mut state = self.state.lock();
            let before = state.threads.len();
            state.threads.retain(|thread| thread.id != thread_id);
            if state.threads.len() == before {
                return false;
            }

            let cleared_current = state.current == Some(thread_id);
            if cleared_current {
                state.current = None;
            }
            self.persist_locked(&mut state);
            cleared_current
        };

        self.dispatcher.forget(thread_id);
        tracing::info!(thread_id = %thread_id, cleared_current, "deleted chat thread");
        self.emit(ThreadEvent::Deleted(thread_id));
        if cleared_current {
            self.emit(ThreadEvent::CurrentChanged(None));
        }
        true
    }

    /// Re-reads the collection from the store, replacing everything held in memory except
    /// the placeholders of replies still in flight here.
    pub fn reload(&self) {
        {
            let mut state = self.state.lock();
            let snapshot = read_snapshot(self.store.as_ref());
            self.replace_locked(&mut state, snapshot);
        }
        self.emit(ThreadEvent::Reloaded);
    }

    /// Reloads only when the stored collection differs from what this repository last
    /// wrote or read. Returns whether it reloaded.
    pub fn reload_if_changed(&self) -> bool {
        {
            let mut state = self.state.lock();
            let snapshot = read_snapshot(self.store.as_ref());
            if snapshot == state.snapshot {
                return false;
            }
            self.replace_locked(&mut state, snapshot);
        }
        self.emit(ThreadEvent::Reloaded);
        true
    }

    /// Follows the store's change feed and reloads when another holder rewrites the
    /// thread keys. The task ends once the repository is dropped.
    pub fn watch_store(self: &Arc<Self>) -> JoinHandle<()> {
        let changes = self.store.subscribe();
        tokio::spawn(watch_changes(Arc::downgrade(self), changes))
    }

    pub fn is_streaming(&self, thread_id: ThreadId) -> bool {
        self.dispatcher.is_streaming(thread_id)
    }

    pub fn stream_state(&self, thread_id: ThreadId) -> StreamState {
        self.dispatcher.stream_state(thread_id)
    }

    pub fn register_streaming_callback(&self, thread_id: ThreadId, callback: ChunkCallback) -> bool {
        self.dispatcher
            .register_streaming_callback(thread_id, callback)
    }

    pub fn unregister_streaming_callback(&self, thread_id: ThreadId) {
        self.dispatcher.unregister_streaming_callback(thread_id);
    }

    /// Stops every in-flight reply, not only the current thread's.
    pub fn stop_streaming(&self) -> usize {
        self.dispatcher.stop_streaming()
    }

    pub fn stop_thread(&self, thread_id: ThreadId) -> bool {
        self.dispatcher.stop_thread(thread_id)
    }

    /// Appends the user message to the given (or current) thread, then produces and
    /// streams the assistant reply.
    ///
    /// The returned message is the one stored in the thread. On failure the loading
    /// placeholder is gone and the user message stays.
    pub async fn send_message_with_streaming(
        &self,
        text: &str,
        on_chunk: Option<ChunkCallback>,
        thread_id: Option<ThreadId>,
    ) -> ChatResult<ChatMessage> {
        let (thread_id, request) = {
            let mut state = self.state.lock();
            let thread_id = state.resolve(thread_id, "send-message")?;
            let thread = state
                .thread_mut(thread_id)
                .context(ThreadNotFoundSnafu {
                    stage: "send-message",
                    thread_id,
                })?;

            thread.messages.push(ChatMessage::user(text));
            thread.touch();
            let request = request_for(thread, text);
            self.persist_locked(&mut state);
            (thread_id, request)
        };

        self.emit(ThreadEvent::Updated(thread_id));
        self.respond(thread_id, request, on_chunk).await
    }

    /// Rewrites a user message, drops everything after it and asks again.
    ///
    /// Destructive: the discarded replies are not recoverable.
    pub async fn edit_message_and_resend(
        &self,
        message_id: MessageId,
        new_text: &str,
        on_chunk: Option<ChunkCallback>,
        thread_id: Option<ThreadId>,
    ) -> ChatResult<ChatMessage> {
        let stage = "edit-message";
        let (thread_id, request) = {
            let mut state = self.state.lock();
            let thread_id = state.resolve(thread_id, stage)?;
            let thread = state
                .thread_mut(thread_id)
                .context(ThreadNotFoundSnafu { stage, thread_id })?;

            let index = thread.message_index(message_id).context(MessageNotFoundSnafu {
                stage,
                thread_id,
                message_id,
            })?;
            if thread.messages[index].role != Role::User {
                return MessageNotEditableSnafu { stage, message_id }.fail();
            }

            thread.messages[index].content = new_text.to_string();
            thread.messages.truncate(index + 1);
            thread.touch();
            let request = request_for(thread, new_text);
            self.persist_locked(&mut state);
            (thread_id, request)
        };

        // An older reply still streaming into this thread would land after the edit.
        self.dispatcher.stop_thread(thread_id);
        tracing::info!(thread_id = %thread_id, message_id = %message_id, "edited message");
        self.emit(ThreadEvent::Updated(thread_id));
        self.respond(thread_id, request, on_chunk).await
    }

    async fn respond(
        &self,
        thread_id: ThreadId,
        request: GenerateRequest,
        on_chunk: Option<ChunkCallback>,
    ) -> ChatResult<ChatMessage> {
        let placeholder = ChatMessage::loading_placeholder();
        let placeholder_id = placeholder.id;
        self.mutate_thread(thread_id, "insert-placeholder", move |thread| {
            thread.messages.push(placeholder);
        })?;

        let mut pending = PendingReply::new(self, thread_id, placeholder_id);
        let session = self.dispatcher.begin(thread_id, on_chunk);

        let reply = match self.generator.generate(request).await {
            Ok(reply) => reply,
            Err(source) => {
                tracing::warn!(thread_id = %thread_id, error = %source, "reply generation failed");
                self.dispatcher.mark_failed(session.target(), source.to_string());
                return Err(ChatError::Generate {
                    stage: "generate-reply",
                    source,
                });
            }
        };

        let content = match session.reveal(&reply).await {
            StreamOutcome::Completed => reply,
            StreamOutcome::Cancelled { revealed } if revealed.is_empty() => {
                return StreamCancelledSnafu {
                    stage: "stream-reply",
                    thread_id,
                }
                .fail();
            }
            StreamOutcome::Cancelled { revealed } => revealed,
        };
        drop(session);

        let message = self.finalize_reply(thread_id, placeholder_id, content)?;
        pending.disarm();
        Ok(message)
    }

    fn finalize_reply(
        &self,
        thread_id: ThreadId,
        placeholder_id: MessageId,
        content: String,
    ) -> ChatResult<ChatMessage> {
        let stage = "finalize-reply";
        let message = ChatMessage {
            id: placeholder_id,
            ..ChatMessage::assistant(content)
        };

        let landed = {
            let mut state = self.state.lock();
            let thread = state
                .thread_mut(thread_id)
                .context(ThreadNotFoundSnafu { stage, thread_id })?;
            match thread.message_index(placeholder_id) {
                Some(index) => {
                    thread.messages[index] = message.clone();
                    thread.touch();
                    self.persist_locked(&mut state);
                    true
                }
                None => false,
            }
        };

        if !landed {
            tracing::warn!(thread_id = %thread_id, "placeholder vanished before the reply landed");
            return ReplySupersededSnafu { stage, thread_id }.fail();
        }
        self.emit(ThreadEvent::Updated(thread_id));
        Ok(message)
    }

    fn remove_message(&self, thread_id: ThreadId, message_id: MessageId) {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.thread_mut(thread_id).is_some_and(|thread| {
                let before = thread.messages.len();
                thread.messages.retain(|message| message.id != message_id);
                thread.messages.len() != before
            });
            if removed {
                self.persist_locked(&mut state);
            }
            removed
        };

        if removed {
            self.emit(ThreadEvent::Updated(thread_id));
        }
    }

    fn mutate_thread(
        &self,
        thread_id: ThreadId,
        stage: &'static str,
        mutate: impl FnOnce(&mut ChatThread),
    ) -> ChatResult<()> {
        {
            let mut state = self.state.lock();
            let thread = state
                .thread_mut(thread_id)
                .context(ThreadNotFoundSnafu { stage, thread_id })?;
            mutate(thread);
            self.persist_locked(&mut state);
        }

        self.emit(ThreadEvent::Updated(thread_id));
        Ok(())
    }

    fn replace_locked(&self, state: &mut ThreadState, snapshot: StoredSnapshot) {
        let mut loaded = state_from_snapshot(snapshot);
        for thread in &state.threads {
            let Some(target) = loaded.thread_mut(thread.id) else {
                continue;
            };
            for placeholder in thread.messages.iter().filter(|message| message.is_loading) {
                if target.message_index(placeholder.id).is_none() {
                    target.messages.push(placeholder.clone());
                }
            }
        }

        tracing::debug!(threads = loaded.threads.len(), "reloaded chat threads");
        *state = loaded;
    }

    fn persist_locked(&self, state: &mut ThreadState) {
        match serde_json::to_string(&state.threads) {
            Ok(raw) => match self.store.set(THREADS_KEY, &raw) {
                Ok(()) => state.snapshot.threads = Some(raw),
                Err(error) => tracing::warn!(error = %error, "failed to persist chat threads"),
            },
            Err(error) => tracing::warn!(error = %error, "failed to serialize chat threads"),
        }

        let current = match state.current.map(|thread_id| serde_json::to_string(&thread_id)) {
            Some(Ok(raw)) => Some(raw),
            Some(Err(error)) => {
                tracing::warn!(error = %error, "failed to serialize current thread");
                return;
            }
            None => None,
        };
        let written = match &current {
            Some(raw) => self.store.set(CURRENT_THREAD_KEY, raw),
            None => self.store.remove(CURRENT_THREAD_KEY),
        };
        match written {
            Ok(()) => state.snapshot.current = current,
            Err(error) => tracing::warn!(error = %error, "failed to persist current thread"),
        }
    }

    fn emit(&self, event: ThreadEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!(?event, "thread event dropped; no subscribers");
        }
    }
}

/// Removes the loading placeholder unless the reply landed, including when the send
/// future is dropped mid-flight.
struct PendingReply<'a> {
    repository: &'a ThreadRepository,
    thread_id: ThreadId,
    placeholder_id: MessageId,
    armed: bool,
}

impl<'a> PendingReply<'a> {
    fn new(repository: &'a ThreadRepository, thread_id: ThreadId, placeholder_id: MessageId) -> Self {
        Self {
            repository,
            thread_id,
            placeholder_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.repository
                .remove_message(self.thread_id, self.placeholder_id);
        }
    }
}

fn request_for(thread: &ChatThread, text: &str) -> GenerateRequest {
    GenerateRequest::new(text, thread.assistant.clone(), thread.assistant_name.clone())
}

async fn watch_changes(
    repository: Weak<ThreadRepository>,
    mut changes: broadcast::Receiver<storefront_storage::StoreChange>,
) {
    loop {
        let relevant = match changes.recv().await {
            Ok(change) => change.key == THREADS_KEY || change.key == CURRENT_THREAD_KEY,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "store change feed lagged; rechecking threads");
                true
            }
            Err(RecvError::Closed) => break,
        };
        let Some(repository) = repository.upgrade() else {
            break;
        };
        if relevant && repository.reload_if_changed() {
            tracing::info!("picked up chat threads written elsewhere");
        }
    }
}

fn read_snapshot(store: &dyn KeyValueStore) -> StoredSnapshot {
    let read = |key: &str| {
        store.get(key).unwrap_or_else(|error| {
            tracing::warn!(key, error = %error, "failed to read stored chat state");
            None
        })
    };
    StoredSnapshot {
        threads: read(THREADS_KEY),
        current: read(CURRENT_THREAD_KEY),
    }
}

fn load_state(store: &dyn KeyValueStore) -> ThreadState {
    state_from_snapshot(read_snapshot(store))
}

fn state_from_snapshot(snapshot: StoredSnapshot) -> ThreadState {
    let stored_threads = snapshot
        .threads
        .as_deref()
        .map(serde_json::from_str::<Vec<ChatThread>>);
    let mut threads = match stored_threads {
        None => Vec::new(),
        Some(Ok(threads)) => threads,
        Some(Err(error)) => {
            tracing::warn!(error = %error, "stored chat threads unreadable; starting empty");
            Vec::new()
        }
    };

    // Placeholders only survive a crash mid-reply; nothing will ever resolve them.
    for thread in &mut threads {
        thread.messages.retain(|message| !message.is_loading);
    }

    let current = match snapshot.current.as_deref().map(serde_json::from_str::<ThreadId>) {
        None => None,
        Some(Ok(current)) => Some(current),
        Some(Err(error)) => {
            tracing::warn!(error = %error, "stored current thread unreadable");
            None
        }
    }
    .filter(|thread_id| threads.iter().any(|thread| thread.id == *thread_id));

    ThreadState {
        threads,
        current,
        snapshot,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use storefront_llm::{AssistantResponder, BoxFuture, ProviderError, ProviderResult};
    use storefront_storage::{JsonStoreExt, MemoryStore};

    use super::*;
    use crate::chat::stream::StreamDelay;

    struct FixedReply(&'static str);

    impl ResponseGenerator for FixedReply {
        fn generate(&self, _request: GenerateRequest) -> BoxFuture<'_, ProviderResult<String>> {
            Box::pin(async move { Ok(self.0.to_string()) })
        }
    }

    struct SlowReply(Duration);

    impl ResponseGenerator for SlowReply {
        fn generate(&self, _request: GenerateRequest) -> BoxFuture<'_, ProviderResult<String>> {
            Box::pin(async move {
                tokio::time::sleep(self.0).await;
                Ok("late answer".to_string())
            })
        }
    }

    struct FailingReply;

    impl ResponseGenerator for FailingReply {
        fn generate(&self, _request: GenerateRequest) -> BoxFuture<'_, ProviderResult<String>> {
            Box::pin(async {
                Err(ProviderError::MissingAssistantReply {
                    stage: "test",
                    thread_id: "thread_remote".to_string(),
                })
            })
        }
    }

    fn repository_with(
        store: Arc<MemoryStore>,
        generator: impl ResponseGenerator + 'static,
    ) -> ThreadRepository {
        ThreadRepository::new(
            store,
            Arc::new(generator),
            StreamingDispatcher::new(StreamDelay::new(
                Duration::from_millis(10),
                Duration::from_millis(10),
            )),
        )
    }

    fn repository(generator: impl ResponseGenerator + 'static) -> ThreadRepository {
        repository_with(Arc::new(MemoryStore::new()), generator)
    }

    fn ids(threads: &[ChatThread]) -> Vec<ThreadId> {
        threads.iter().map(|thread| thread.id).collect()
    }

    #[test]
    fn creating_twice_yields_distinct_threads_and_latest_is_current() {
        let repository = repository(FixedReply("ok"));

        let first = repository.create_thread("it-support", "IT Support");
        let second = repository.create_thread("it-support", "IT Support");

        assert_ne!(first, second);
        assert_eq!(repository.current_thread_id(), Some(second));
        assert_eq!(repository.get_all_threads().len(), 2);
    }

    #[test]
    fn pin_reorders_but_rename_does_not() {
        let repository = repository(FixedReply("ok"));
        let older = repository.create_thread("hr", "HR Assistant");
        std::thread::sleep(Duration::from_millis(2));
        let newer = repository.create_thread("sales", "Sales Assistant");
        assert_eq!(ids(&repository.get_all_threads()), vec![newer, older]);

        let before_rename = repository.get_thread(older).map(|thread| thread.updated_at);
        std::thread::sleep(Duration::from_millis(2));
        repository
            .rename_thread(older, "Benefits questions")
            .expect("rename");
        let renamed = repository.get_thread(older).expect("thread");
        assert_eq!(Some(renamed.updated_at), before_rename);
        assert_eq!(renamed.title(), "Benefits questions");
        assert_eq!(ids(&repository.get_all_threads()), vec![newer, older]);

        std::thread::sleep(Duration::from_millis(2));
        repository.pin_thread(older, true).expect("pin");
        let threads = repository.get_all_threads();
        assert_eq!(ids(&threads), vec![older, newer]);
        assert!(threads[0].is_pinned);
    }

    #[test]
    fn blank_rename_clears_custom_title() {
        let repository = repository(FixedReply("ok"));
        let thread_id = repository.create_thread("hr", "HR Assistant");

        repository.rename_thread(thread_id, "Payroll").expect("rename");
        repository.rename_thread(thread_id, "   ").expect("clear");

        let thread = repository.get_thread(thread_id).expect("thread");
        assert_eq!(thread.custom_title, None);
        assert_eq!(thread.title(), "Chat with HR Assistant");
    }

    #[test]
    fn set_current_ignores_unknown_ids() {
        let repository = repository(FixedReply("ok"));
        let first = repository.create_thread("hr", "HR Assistant");
        let second = repository.create_thread("sales", "Sales Assistant");

        assert!(!repository.set_current_thread(ThreadId::new_v7()));
        assert_eq!(repository.current_thread_id(), Some(second));

        assert!(repository.set_current_thread(first));
        assert_eq!(
            repository.get_current_thread().map(|thread| thread.id),
            Some(first)
        );
    }

    #[test]
    fn deleting_current_thread_clears_the_pointer() {
        let store = Arc::new(MemoryStore::new());
        let repository = repository_with(store.clone(), FixedReply("ok"));
        let thread_id = repository.create_thread("hr", "HR Assistant");

        assert!(repository.delete_thread(thread_id));
        assert!(!repository.delete_thread(thread_id));
        assert!(repository.get_current_thread().is_none());
        assert_eq!(store.get(CURRENT_THREAD_KEY).expect("read"), None);
    }

    #[test]
    fn update_thread_replaces_by_id() {
        let repository = repository(FixedReply("ok"));
        let thread_id = repository.create_thread("hr", "HR Assistant");

        let mut thread = repository.get_thread(thread_id).expect("thread");
        thread.messages.push(ChatMessage::user("imported"));
        repository.update_thread(thread.clone()).expect("update");
        assert_eq!(repository.get_thread(thread_id), Some(thread));

        let unknown = ChatThread::new("hr", "HR Assistant");
        assert!(matches!(
            repository.update_thread(unknown),
            Err(ChatError::ThreadNotFound { .. })
        ));
    }

    #[test]
    fn state_survives_a_new_repository_over_the_same_store() {
        let store = Arc::new(MemoryStore::new());
        let first = repository_with(store.clone(), FixedReply("ok"));
        let thread_id = first.create_thread("it-support", "IT Support");
        first.pin_thread(thread_id, true).expect("pin");

        let second = repository_with(store, FixedReply("ok"));
        let thread = second.get_current_thread().expect("current thread restored");
        assert_eq!(thread.id, thread_id);
        assert!(thread.is_pinned);
    }

    #[test]
    fn reload_picks_up_external_writes_and_drops_stale_placeholders() {
        let store = Arc::new(MemoryStore::new());
        let repository = repository_with(store.clone(), FixedReply("ok"));
        let mut events = repository.subscribe();

        let mut thread = ChatThread::new("it-support", "IT Support");
        thread.messages.push(ChatMessage::user("hi"));
        thread.messages.push(ChatMessage::loading_placeholder());
        store
            .save_json(THREADS_KEY, &vec![thread.clone()])
            .expect("seed");

        repository.reload();

        let loaded = repository.get_thread(thread.id).expect("thread");
        assert_eq!(loaded.messages.len(), 1);
        assert!(!loaded.has_loading_message());
        assert_eq!(events.try_recv().ok(), Some(ThreadEvent::Reloaded));
    }

    #[test]
    fn own_writes_do_not_count_as_changes() {
        let store = Arc::new(MemoryStore::new());
        let repository = repository_with(store.clone(), FixedReply("ok"));
        let thread_id = repository.create_thread("hr", "HR Assistant");
        repository.rename_thread(thread_id, "Leave").expect("rename");
        assert!(!repository.reload_if_changed());

        store.remove(CURRENT_THREAD_KEY).expect("clear pointer");
        assert!(repository.reload_if_changed());
        assert_eq!(repository.current_thread_id(), None);
    }

    fn reload_count(events: &mut broadcast::Receiver<ThreadEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = events.try_recv() {
            if event == ThreadEvent::Reloaded {
                count += 1;
            }
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn watchers_keep_two_repositories_over_one_store_in_step() {
        let store = Arc::new(MemoryStore::new());
        let first = Arc::new(repository_with(store.clone(), FixedReply("ok")));
        let second = Arc::new(repository_with(store.clone(), FixedReply("ok")));
        let _first_watch = first.watch_store();
        let _second_watch = second.watch_store();
        let mut first_events = first.subscribe();
        let mut second_events = second.subscribe();

        let from_first = first.create_thread("hr", "HR Assistant");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(second.get_thread(from_first).is_some());
        assert_eq!(second.current_thread_id(), Some(from_first));

        let from_second = second.create_thread("sales", "Sales Assistant");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(first.get_all_threads().len(), 2);
        assert_eq!(first.current_thread_id(), Some(from_second));

        let fresh = repository_with(store, FixedReply("ok"));
        assert!(fresh.get_thread(from_first).is_some());
        assert!(fresh.get_thread(from_second).is_some());

        assert_eq!(reload_count(&mut first_events), 1);
        assert_eq!(reload_count(&mut second_events), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_stops_with_its_repository() {
        let store = Arc::new(MemoryStore::new());
        let repository = Arc::new(repository_with(store.clone(), FixedReply("ok")));
        let watcher = repository.watch_store();

        drop(repository);
        store.set(THREADS_KEY, "[]").expect("external write");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(watcher.is_finished());
    }

    #[test]
    fn unreadable_store_starts_empty() {
        let store = Arc::new(MemoryStore::new());
        store.set(THREADS_KEY, "{not json").expect("seed");

        let repository = repository_with(store, FixedReply("ok"));
        assert!(repository.get_all_threads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn send_appends_one_user_and_one_assistant_message() {
        let repository = repository(FixedReply("Happy to help with that."));
        let thread_id = repository.create_thread("it-support", "IT Support");

        let reply = repository
            .send_message_with_streaming("hello", None, None)
            .await
            .expect("send");

        let thread = repository.get_thread(thread_id).expect("thread");
        assert_eq!(thread.messages.len(), 2);
        assert_eq!(thread.messages[0].role, Role::User);
        assert_eq!(thread.messages[0].content, "hello");
        assert_eq!(thread.messages[1], reply);
        assert_eq!(reply.content, "Happy to help with that.");
        assert!(!thread.has_loading_message());
        assert!(!repository.is_streaming(thread_id));
    }

    #[tokio::test(start_paused = true)]
    async fn placeholder_is_visible_while_streaming() {
        let repository = Arc::new(repository(FixedReply("one two three four")));
        let thread_id = repository.create_thread("it-support", "IT Support");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let callback: ChunkCallback = {
            let repository = repository.clone();
            let seen = seen.clone();
            Arc::new(move |_prefix: &str| {
                let loading = repository
                    .get_thread(thread_id)
                    .is_some_and(|thread| thread.has_loading_message());
                seen.lock().push(loading);
            })
        };

        repository
            .send_message_with_streaming("hi", Some(callback), Some(thread_id))
            .await
            .expect("send");

        assert_eq!(seen.lock().as_slice(), &[true, true, true, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_generation_removes_placeholder_and_keeps_user_message() {
        let repository = repository(FailingReply);
        let thread_id = repository.create_thread("asst_remote", "Research Bot");

        let error = repository
            .send_message_with_streaming("summarize", None, None)
            .await
            .expect_err("generation fails");
        assert!(matches!(error, ChatError::Generate { .. }));

        let thread = repository.get_thread(thread_id).expect("thread");
        assert_eq!(thread.messages.len(), 1);
        assert_eq!(thread.messages[0].role, Role::User);
        assert!(!repository.is_streaming(thread_id));
    }

    #[tokio::test(start_paused = true)]
    async fn send_without_any_thread_is_an_error() {
        let repository = repository(FixedReply("ok"));

        let error = repository
            .send_message_with_streaming("hello", None, None)
            .await
            .expect_err("no thread");
        assert!(matches!(error, ChatError::NoCurrentThread { .. }));

        let error = repository
            .send_message_with_streaming("hello", None, Some(ThreadId::new_v7()))
            .await
            .expect_err("unknown thread");
        assert!(matches!(error, ChatError::ThreadNotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn edit_truncates_after_the_edited_message_and_resends() {
        let repository = repository(FixedReply("fresh answer"));
        let thread_id = repository.create_thread("it-support", "IT Support");
        for text in ["first", "second", "third"] {
            repository
                .send_message_with_streaming(text, None, None)
                .await
                .expect("send");
        }
        let thread = repository.get_thread(thread_id).expect("thread");
        assert_eq!(thread.messages.len(), 6);
        let edited_id = thread.messages[2].id;

        let reply = repository
            .edit_message_and_resend(edited_id, "second, reworded", None, None)
            .await
            .expect("resend");

        let thread = repository.get_thread(thread_id).expect("thread");
        assert_eq!(thread.messages.len(), 4);
        assert_eq!(thread.messages[2].id, edited_id);
        assert_eq!(thread.messages[2].content, "second, reworded");
        assert_eq!(thread.messages[3], reply);
        assert_eq!(
            thread
                .messages
                .iter()
                .filter(|message| message.role == Role::User)
                .count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn only_user_messages_can_be_edited() {
        let repository = repository(FixedReply("answer"));
        repository.create_thread("it-support", "IT Support");
        let reply = repository
            .send_message_with_streaming("question", None, None)
            .await
            .expect("send");

        let error = repository
            .edit_message_and_resend(reply.id, "rewrite", None, None)
            .await
            .expect_err("assistant message");
        assert!(matches!(error, ChatError::MessageNotEditable { .. }));

        let error = repository
            .edit_message_and_resend(MessageId::new_v7(), "rewrite", None, None)
            .await
            .expect_err("unknown message");
        assert!(matches!(error, ChatError::MessageNotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn global_stop_keeps_revealed_prefixes_for_every_thread() {
        let repository = Arc::new(repository(FixedReply(
            "alpha beta gamma delta epsilon zeta eta theta iota kappa",
        )));
        let first = repository.create_thread("hr", "HR Assistant");
        let second = repository.create_thread("sales", "Sales Assistant");

        let stopper = {
            let repository = repository.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(25)).await;
                repository.stop_streaming()
            }
        };

        let (first_reply, second_reply, stopped) = tokio::join!(
            repository.send_message_with_streaming("a", None, Some(first)),
            repository.send_message_with_streaming("b", None, Some(second)),
            stopper
        );

        assert_eq!(stopped, 2);
        for (thread_id, reply) in [(first, first_reply), (second, second_reply)] {
            let reply = reply.expect("partial reply kept");
            assert_eq!(reply.content, "alpha beta gamma");
            let thread = repository.get_thread(thread_id).expect("thread");
            assert_eq!(thread.messages.len(), 2);
            assert_eq!(thread.messages[1].content, "alpha beta gamma");
            assert!(!repository.is_streaming(thread_id));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_generation_reports_cancellation() {
        let repository = repository(SlowReply(Duration::from_millis(50)));
        let thread_id = repository.create_thread("hr", "HR Assistant");

        let send = repository.send_message_with_streaming("hi", None, None);
        let stopper = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            repository.stop_thread(thread_id)
        };
        let (result, stopped) = tokio::join!(send, stopper);

        assert!(stopped);
        assert!(matches!(result, Err(ChatError::StreamCancelled { .. })));
        let thread = repository.get_thread(thread_id).expect("thread");
        assert_eq!(thread.messages.len(), 1);
        assert!(!thread.has_loading_message());
    }

    #[tokio::test(start_paused = true)]
    async fn reply_overtaken_by_an_edit_is_superseded() {
        let repository = repository(FixedReply("alpha beta gamma delta epsilon zeta"));
        let thread_id = repository.create_thread("it-support", "IT Support");
        repository
            .send_message_with_streaming("first", None, None)
            .await
            .expect("first reply");
        let first_question = repository.get_thread(thread_id).expect("thread").messages[0].id;

        let older = repository.send_message_with_streaming("second", None, None);
        let edit = async {
            tokio::time::sleep(Duration::from_millis(25)).await;
            repository
                .edit_message_and_resend(first_question, "first, reworded", None, None)
                .await
        };
        let (older, edited) = tokio::join!(older, edit);

        assert!(matches!(older, Err(ChatError::ReplySuperseded { .. })));
        let edited = edited.expect("edited reply");
        let thread = repository.get_thread(thread_id).expect("thread");
        assert_eq!(thread.messages.len(), 2);
        assert_eq!(thread.messages[0].content, "first, reworded");
        assert_eq!(thread.messages[1], edited);
        assert!(matches!(
            repository.stream_state(thread_id),
            StreamState::Completed(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reload_keeps_placeholders_of_replies_in_flight() {
        let store = Arc::new(MemoryStore::new());
        let repository = Arc::new(repository_with(store.clone(), FixedReply("one two three")));
        let thread_id = repository.create_thread("it-support", "IT Support");

        let reloader = {
            let repository = repository.clone();
            let store = store.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let mut stored = repository.get_thread(thread_id).expect("thread");
                stored.messages.retain(|message| !message.is_loading);
                stored.custom_title = Some("Edited elsewhere".to_string());
                store.save_json(THREADS_KEY, &vec![stored]).expect("external write");
                repository.reload_if_changed()
            }
        };
        let (reply, reloaded) = tokio::join!(
            repository.send_message_with_streaming("hi", None, None),
            reloader
        );

        assert!(reloaded);
        let reply = reply.expect("reply lands after the reload");
        let thread = repository.get_thread(thread_id).expect("thread");
        assert_eq!(thread.title(), "Edited elsewhere");
        assert_eq!(thread.messages.last(), Some(&reply));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_send_cleans_up_placeholder_and_session() {
        let repository = repository(FixedReply("a long answer that takes a while"));
        let thread_id = repository.create_thread("hr", "HR Assistant");

        let send = repository.send_message_with_streaming("hi", None, None);
        let outcome = tokio::time::timeout(Duration::from_millis(15), send).await;
        assert!(outcome.is_err());

        let thread = repository.get_thread(thread_id).expect("thread");
        assert_eq!(thread.messages.len(), 1);
        assert!(!repository.is_streaming(thread_id));
    }

    #[tokio::test(start_paused = true)]
    async fn canned_generator_answers_it_support_greeting() {
        let repository = repository(AssistantResponder::default());
        repository.create_thread("it-support", "IT Support");

        let reply = repository
            .send_message_with_streaming("hello", None, None)
            .await
            .expect("send");

        let variants = storefront_llm::CannedResponses::new().variants_for("hello", "IT Support");
        assert!(variants.contains(&reply.content));
    }

    #[tokio::test(start_paused = true)]
    async fn events_name_the_changed_thread() {
        let repository = repository(FixedReply("ok"));
        let mut events = repository.subscribe();

        let thread_id = repository.create_thread("hr", "HR Assistant");
        repository.pin_thread(thread_id, true).expect("pin");
        repository.delete_thread(thread_id);

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert_eq!(
            received,
            vec![
                ThreadEvent::Created(thread_id),
                ThreadEvent::CurrentChanged(Some(thread_id)),
                ThreadEvent::Updated(thread_id),
                ThreadEvent::Deleted(thread_id),
                ThreadEvent::CurrentChanged(None),
            ]
        );
    }
}
