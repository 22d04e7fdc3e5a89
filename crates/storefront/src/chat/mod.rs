mod error;
mod events;
mod message;
mod repository;
mod stream;

pub use error::{ChatError, ChatResult};
pub use events::ThreadEvent;
pub use message::{ChatMessage, ChatThread, DERIVED_TITLE_MAX_CHARS, Role};
pub use repository::{CURRENT_THREAD_KEY, THREADS_KEY, ThreadRepository};
pub use stream::{
    ChunkCallback, StreamDelay, StreamOutcome, StreamSession, StreamSessionId, StreamState,
    StreamTarget, StreamTransition, StreamTransitionRejection, StreamingDispatcher,
};
