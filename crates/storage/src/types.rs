use super::ids::{MessageId, ThreadId, UserId};

/// Default number of messages returned by one listing page.
pub const DEFAULT_MESSAGE_PAGE_SIZE: u32 = 50;

/// Account role; staff roles never show up as chat contacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UserRole {
    #[default]
    Member,
    Seller,
    Employee,
    Admin,
    SuperAdmin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Seller => "seller",
            Self::Employee => "employee",
            Self::Admin => "admin",
            Self::SuperAdmin => "super_admin",
        }
    }

    /// Unknown role strings fall back to `Member`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "seller" => Self::Seller,
            "employee" => Self::Employee,
            "admin" => Self::Admin,
            "super_admin" => Self::SuperAdmin,
            _ => Self::Member,
        }
    }

    pub fn is_staff(&self) -> bool {
        matches!(self, Self::Employee | Self::Admin | Self::SuperAdmin)
    }
}

/// Seller organization tier shown next to a partner's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Light,
    Standard,
    Advance,
    Elite,
    Legend,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Standard => "standard",
            Self::Advance => "advance",
            Self::Elite => "elite",
            Self::Legend => "legend",
        }
    }

    /// Case-insensitive; anything unrecognized means "no tier".
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "light" => Some(Self::Light),
            "standard" => Some(Self::Standard),
            "advance" => Some(Self::Advance),
            "elite" => Some(Self::Elite),
            "legend" => Some(Self::Legend),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadKind {
    UserToUser,
    AdminToUser,
    System,
}

impl ThreadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserToUser => "user_to_user",
            Self::AdminToUser => "admin_to_user",
            Self::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "user_to_user" => Some(Self::UserToUser),
            "admin_to_user" => Some(Self::AdminToUser),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub email: String,
    pub name: Option<String>,
    pub nickname: Option<String>,
    pub profile_name: Option<String>,
    pub role: UserRole,
    pub tier: Option<Tier>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewUser {
    pub email: String,
    pub name: Option<String>,
    pub nickname: Option<String>,
    pub profile_name: Option<String>,
    pub role: UserRole,
    pub tier: Option<Tier>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    pub id: ThreadId,
    pub kind: ThreadKind,
    pub participant_1: UserId,
    pub participant_2: UserId,
    pub last_message_content: Option<String>,
    pub last_message_at_unix_ms: Option<u64>,
    pub created_at_unix_ms: u64,
}

impl ThreadRecord {
    /// Returns the participant that is not `viewer`.
    pub fn partner_of(&self, viewer: UserId) -> UserId {
        if self.participant_1 == viewer {
            self.participant_2
        } else {
            self.participant_1
        }
    }
}

/// One row of the viewer's thread listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSummary {
    pub thread: ThreadRecord,
    pub partner: Option<UserRecord>,
    pub unread_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub sender_id: UserId,
    pub content: String,
    pub is_read: bool,
    pub read_at_unix_ms: Option<u64>,
    pub created_at_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub receiver_id: UserId,
    pub content: String,
}

/// Result of a successful send; the thread may have been created by this call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message: MessageRecord,
    pub thread_id: ThreadId,
}

/// Position of one stored message. Ties on the timestamp are broken by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MessageCursor {
    pub created_at_unix_ms: u64,
    pub message_id: MessageId,
}

impl MessageCursor {
    pub fn of(record: &MessageRecord) -> Self {
        Self {
            created_at_unix_ms: record.created_at_unix_ms,
            message_id: record.id,
        }
    }
}

/// The newest `limit` messages, optionally strictly older than `before`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessagePage {
    pub limit: u32,
    pub before: Option<MessageCursor>,
}

impl MessagePage {
    pub fn latest(limit: u32) -> Self {
        Self {
            limit,
            before: None,
        }
    }

    pub fn before(limit: u32, cursor: MessageCursor) -> Self {
        Self {
            limit,
            before: Some(cursor),
        }
    }
}

impl Default for MessagePage {
    fn default() -> Self {
        Self::latest(DEFAULT_MESSAGE_PAGE_SIZE)
    }
}
