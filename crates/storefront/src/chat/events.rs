use storefront_storage::ThreadId;

/// Change notification published by the thread repository after each mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadEvent {
    Created(ThreadId),
    Updated(ThreadId),
    Deleted(ThreadId),
    /// `None` when the pointer was cleared.
    CurrentChanged(Option<ThreadId>),
    /// The whole collection was re-read from the store.
    Reloaded,
}

impl ThreadEvent {
    pub fn thread_id(&self) -> Option<ThreadId> {
        match self {
            Self::Created(id) | Self::Updated(id) | Self::Deleted(id) => Some(*id),
            Self::CurrentChanged(id) => *id,
            Self::Reloaded => None,
        }
    }
}
