use std::sync::Arc;

use farmchat_storage::{SqliteStorage, StorageResult, UserId};

pub mod chat;
pub mod error;
pub mod settings;

pub use chat::{
    BadgeFilter, ChatSession, Message, MessageKey, Partner, SendNotice, SendOutcome, SessionEvent,
    SessionEvents, Thread, ThreadKey, ThreadView, UnreadSummary, badge_label,
};
pub use error::{FetchError, FetchResult, SendError, SendResult, SubscriptionError};
pub use settings::{ChatSettings, SettingsError, SettingsStore};

/// Opens the configured sqlite store and mounts a session for `viewer` on it.
pub async fn open_sqlite_session(
    settings: ChatSettings,
    viewer: UserId,
) -> StorageResult<(Arc<SqliteStorage>, ChatSession, SessionEvents)> {
    let storage = Arc::new(SqliteStorage::open(&settings.database_url).await?);
    let (session, events) = ChatSession::new(storage.clone(), viewer, settings);
    Ok((storage, session, events))
}
