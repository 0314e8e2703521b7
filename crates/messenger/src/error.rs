use farmchat_storage::{StorageError, ThreadId, UserId};
use snafu::Snafu;

use crate::chat::ThreadKey;

pub type FetchResult<T> = Result<T, FetchError>;
pub type SendResult<T> = Result<T, SendError>;

/// A listing call failed. Callers keep whatever they showed before.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FetchError {
    #[snafu(display("failed to list {listing} on `{stage}`: {source}"))]
    Listing {
        stage: &'static str,
        listing: &'static str,
        source: StorageError,
    },
    #[snafu(display("cannot start a conversation with yourself ({user_id})"))]
    SelfConversation {
        stage: &'static str,
        user_id: UserId,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SendError {
    #[snafu(display("message is empty"))]
    EmptyContent { stage: &'static str },
    #[snafu(display("no thread is open"))]
    NoOpenThread { stage: &'static str },
    #[snafu(display("a message is already being sent to thread {thread}"))]
    AlreadySending {
        stage: &'static str,
        thread: ThreadKey,
    },
    #[snafu(display("the server rejected the message on `{stage}`: {source}"))]
    Rejected {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to deliver the message on `{stage}`: {source}"))]
    Transport {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("sending timed out after {timeout_ms}ms"))]
    TimedOut {
        stage: &'static str,
        timeout_ms: u64,
    },
}

impl SendError {
    pub(crate) fn from_storage(stage: &'static str, source: StorageError) -> Self {
        if source.is_rejection() {
            Self::Rejected { stage, source }
        } else {
            Self::Transport { stage, source }
        }
    }

    /// True when the send was refused before anything was inserted or requested.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::EmptyContent { .. } | Self::NoOpenThread { .. } | Self::AlreadySending { .. }
        )
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SubscriptionError {
    #[snafu(display("failed to subscribe to thread {thread_id} on `{stage}`: {source}"))]
    Subscribe {
        stage: &'static str,
        thread_id: ThreadId,
        source: StorageError,
    },
}
