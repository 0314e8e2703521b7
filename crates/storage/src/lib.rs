use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod feed;
pub mod ids;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use feed::{
    FeedCancel, FeedEvent, FeedEvents, FeedHub, FeedSender, FeedSubscription, feed_channel,
};
pub use ids::{MessageId, ThreadId, UserId};
pub use sqlite::SqliteStorage;
pub use types::{
    DEFAULT_MESSAGE_PAGE_SIZE, MessageCursor, MessagePage, MessageRecord, NewMessage, NewUser,
    SendReceipt, ThreadKind, ThreadRecord, ThreadSummary, Tier, UserRecord, UserRole,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait ThreadStore: Send + Sync {
    /// Every thread `viewer` participates in, in the store's presentation order.
    fn list_threads<'a>(
        &'a self,
        viewer: UserId,
    ) -> BoxFuture<'a, StorageResult<Vec<ThreadSummary>>>;
}

pub trait MessageStore: Send + Sync {
    /// One page of a thread's messages, oldest first.
    fn list_messages<'a>(
        &'a self,
        thread_id: ThreadId,
        page: MessagePage,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>>;
    /// Persists a message, creating the thread on first contact.
    fn send_message<'a>(
        &'a self,
        sender_id: UserId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<SendReceipt>>;
    fn mark_read<'a>(&'a self, message_ids: Vec<MessageId>) -> BoxFuture<'a, StorageResult<()>>;
}

pub trait UserStore: Send + Sync {
    fn get_user<'a>(
        &'a self,
        user_id: UserId,
    ) -> BoxFuture<'a, StorageResult<Option<UserRecord>>>;
    fn list_users<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<UserRecord>>>;
}

pub trait MessageFeed: Send + Sync {
    fn subscribe(&self, thread_id: ThreadId) -> StorageResult<FeedSubscription>;
}

pub trait Backend: ThreadStore + MessageStore + UserStore + MessageFeed {}

impl<T> Backend for T where T: ThreadStore + MessageStore + UserStore + MessageFeed {}
