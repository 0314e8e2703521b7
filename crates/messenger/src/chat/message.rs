use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use farmchat_storage::{MessageId, MessageRecord, ThreadId, ThreadKind, ThreadSummary, UserId};

use super::partners::Partner;

/// Locally unique id of a message that has not been persisted yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProvisionalToken(pub u64);

impl ProvisionalToken {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ProvisionalToken {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "temp-{}", self.0)
    }
}

/// Hands out provisional tokens for one session.
#[derive(Debug, Default)]
pub struct TokenAllocator {
    issued: AtomicU64,
}

impl TokenAllocator {
    pub fn next(&self) -> ProvisionalToken {
        ProvisionalToken::new(self.issued.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Identity of a cached message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Provisional(ProvisionalToken),
    Persisted(MessageId),
}

impl MessageKey {
    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }

    pub fn persisted_id(&self) -> Option<MessageId> {
        match self {
            Self::Persisted(id) => Some(*id),
            Self::Provisional(_) => None,
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisional(token) => fmt::Display::fmt(token, formatter),
            Self::Persisted(id) => fmt::Display::fmt(id, formatter),
        }
    }
}

impl From<MessageId> for MessageKey {
    fn from(value: MessageId) -> Self {
        Self::Persisted(value)
    }
}

/// Identity of a thread. `New` holds a drafted conversation until its first send persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadKey {
    New { partner: UserId },
    Persisted(ThreadId),
}

impl ThreadKey {
    pub fn is_new(&self) -> bool {
        matches!(self, Self::New { .. })
    }

    pub fn persisted_id(&self) -> Option<ThreadId> {
        match self {
            Self::Persisted(id) => Some(*id),
            Self::New { .. } => None,
        }
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New { .. } => formatter.write_str("new"),
            Self::Persisted(id) => fmt::Display::fmt(id, formatter),
        }
    }
}

impl From<ThreadId> for ThreadKey {
    fn from(value: ThreadId) -> Self {
        Self::Persisted(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub key: MessageKey,
    pub thread: ThreadKey,
    pub sender_id: UserId,
    pub content: String,
    pub is_read: bool,
    pub read_at_unix_ms: Option<u64>,
    pub created_at_unix_ms: u64,
    pub sender: Option<Partner>,
}

impl Message {
    /// Creates the optimistic copy of a message the viewer is sending.
    pub fn provisional(
        token: ProvisionalToken,
        thread: ThreadKey,
        sender_id: UserId,
        content: impl Into<String>,
        sender: Option<Partner>,
    ) -> Self {
        Self {
            key: MessageKey::Provisional(token),
            thread,
            sender_id,
            content: content.into(),
            is_read: false,
            read_at_unix_ms: None,
            created_at_unix_ms: unix_timestamp_ms(),
            sender,
        }
    }

    pub fn from_record(record: MessageRecord, sender: Option<Partner>) -> Self {
        Self {
            key: MessageKey::Persisted(record.id),
            thread: ThreadKey::Persisted(record.thread_id),
            sender_id: record.sender_id,
            content: record.content,
            is_read: record.is_read,
            read_at_unix_ms: record.read_at_unix_ms,
            created_at_unix_ms: record.created_at_unix_ms,
            sender,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.key.is_provisional()
    }

    pub fn sender_name(&self) -> Option<&str> {
        self.sender
            .as_ref()
            .map(|partner| partner.display_name.as_str())
    }
}

/// A conversation as the widget sees it, from the viewer's side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    pub key: ThreadKey,
    pub kind: ThreadKind,
    pub viewer: UserId,
    pub partner: Partner,
    pub last_message_content: Option<String>,
    pub last_message_at_unix_ms: Option<u64>,
    pub unread_count: u32,
}

impl Thread {
    pub fn from_summary(summary: ThreadSummary, viewer: UserId) -> Self {
        let partner_id = summary.thread.partner_of(viewer);
        let partner = summary
            .partner
            .as_ref()
            .map(Partner::from_record)
            .unwrap_or_else(|| Partner::unknown(partner_id));

        Self {
            key: ThreadKey::Persisted(summary.thread.id),
            kind: summary.thread.kind,
            viewer,
            partner,
            last_message_content: summary.thread.last_message_content,
            last_message_at_unix_ms: summary.thread.last_message_at_unix_ms,
            unread_count: summary.unread_count,
        }
    }

    /// A conversation with `partner` that does not exist on the server yet.
    pub fn draft(viewer: UserId, partner: Partner) -> Self {
        Self {
            key: ThreadKey::New {
                partner: partner.id,
            },
            kind: ThreadKind::UserToUser,
            viewer,
            partner,
            last_message_content: None,
            last_message_at_unix_ms: None,
            unread_count: 0,
        }
    }

    pub fn partner_id(&self) -> UserId {
        self.partner.id
    }

    pub fn persisted_id(&self) -> Option<ThreadId> {
        self.key.persisted_id()
    }

    pub fn promote(&mut self, thread_id: ThreadId) {
        self.key = ThreadKey::Persisted(thread_id);
    }
}

pub(crate) fn unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}
