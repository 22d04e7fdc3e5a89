use snafu::Snafu;
use storefront_llm::ProviderError;
use storefront_storage::{MessageId, ThreadId};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("thread {thread_id} does not exist"))]
    ThreadNotFound {
        stage: &'static str,
        thread_id: ThreadId,
    },
    #[snafu(display("no current thread to {stage}"))]
    NoCurrentThread { stage: &'static str },
    #[snafu(display("message {message_id} does not exist in thread {thread_id}"))]
    MessageNotFound {
        stage: &'static str,
        thread_id: ThreadId,
        message_id: MessageId,
    },
    #[snafu(display("message {message_id} is not a user message and cannot be edited"))]
    MessageNotEditable {
        stage: &'static str,
        message_id: MessageId,
    },
    #[snafu(display("reply for thread {thread_id} was stopped before any text was shown"))]
    StreamCancelled {
        stage: &'static str,
        thread_id: ThreadId,
    },
    /// The thread was rewritten (edited or reloaded) while this reply streamed.
    #[snafu(display("reply for thread {thread_id} was superseded before it landed"))]
    ReplySuperseded {
        stage: &'static str,
        thread_id: ThreadId,
    },
    #[snafu(display("failed to generate a reply on `{stage}`: {source}"))]
    Generate {
        stage: &'static str,
        source: ProviderError,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;
