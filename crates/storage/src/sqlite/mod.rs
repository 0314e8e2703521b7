use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ResultExt, ensure};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu, RejectedSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu,
    SqliteQuerySnafu, StorageError, StorageResult,
};
use super::feed::{FeedEvent, FeedHub, FeedSubscription};
use super::ids::{MessageId, ThreadId, UserId};
use super::types::{
    MessagePage, MessageRecord, NewMessage, NewUser, SendReceipt, ThreadKind, ThreadRecord,
    ThreadSummary, Tier, UserRecord, UserRole,
};
use super::{BoxFuture, MessageFeed, MessageStore, ThreadStore, UserStore};

const USER_COLUMNS: &str = "id, email, name, nickname, profile_name, role, tier";
const THREAD_COLUMNS: &str = "id, thread_type, participant_1, participant_2, last_message_content, last_message_at, created_at";
const MESSAGE_COLUMNS: &str = "id, thread_id, sender_id, content, is_read, read_at, created_at";

/// Reference messaging backend: the collaborator endpoints plus a push feed over one sqlite file.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
    feed: Arc<FeedHub>,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // One connection that never expires, so `:memory:` databases survive between calls.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        // Explicit PRAGMA writes make bootstrap behavior deterministic for QA checks.
        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "sqlite messaging store ready");

        Ok(Self {
            pool,
            database_url,
            feed: Arc::new(FeedHub::new()),
        })
    }

    pub async fn open_in_memory() -> StorageResult<Self> {
        Self::open(":memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn feed(&self) -> &FeedHub {
        &self.feed
    }

    pub async fn create_user(&self, input: NewUser) -> StorageResult<UserRecord> {
        let email = input.email.trim().to_string();
        ensure!(
            !email.is_empty(),
            RejectedSnafu {
                stage: "user-create-validate-email",
                reason: "user email is empty".to_string(),
            }
        );

        let user_id = UserId::new_v7();
        sqlx::query(
            "INSERT INTO users (id, email, name, nickname, profile_name, role, tier, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id.to_string())
        .bind(email.clone())
        .bind(input.name.clone())
        .bind(input.nickname.clone())
        .bind(input.profile_name.clone())
        .bind(input.role.as_str())
        .bind(input.tier.map(|tier| tier.as_str()))
        .bind(unix_timestamp_ms())
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "user-create-insert",
        })?;

        Ok(UserRecord {
            id: user_id,
            email,
            name: input.name,
            nickname: input.nickname,
            profile_name: input.profile_name,
            role: input.role,
            tier: input.tier,
        })
    }

    /// Looks up the thread of `kind` between two users, creating it when absent.
    pub async fn get_or_create_thread(
        &self,
        kind: ThreadKind,
        user_a: UserId,
        user_b: UserId,
    ) -> StorageResult<ThreadRecord> {
        let mut connection = self.pool.acquire().await.context(SqliteQuerySnafu {
            stage: "thread-get-or-create-acquire",
        })?;
        let thread_id = get_or_create_thread_id(&mut connection, kind, user_a, user_b).await?;
        load_thread(&mut connection, thread_id, "thread-get-or-create-load").await
    }

    async fn send_message_inner(
        &self,
        sender_id: UserId,
        input: NewMessage,
    ) -> StorageResult<SendReceipt> {
        let content = input.content.trim().to_string();
        ensure!(
            !content.is_empty(),
            RejectedSnafu {
                stage: "message-send-validate-content",
                reason: "message content is empty".to_string(),
            }
        );
        ensure!(
            sender_id != input.receiver_id,
            RejectedSnafu {
                stage: "message-send-validate-receiver",
                reason: "cannot send a message to yourself".to_string(),
            }
        );

        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "message-send-begin",
        })?;

        ensure_user_exists(&mut tx, sender_id, "message-send-sender-missing").await?;
        ensure_user_exists(&mut tx, input.receiver_id, "message-send-receiver-missing").await?;

        // Thread lookup and message insert commit together so a failed insert never leaves an empty thread.
        let thread_id =
            get_or_create_thread_id(&mut tx, ThreadKind::UserToUser, sender_id, input.receiver_id)
                .await?;

        let message_id = MessageId::new_v7();
        let now = unix_timestamp_ms();

        sqlx::query(
            "INSERT INTO messages (id, thread_id, sender_id, content, is_read, read_at, created_at) VALUES (?, ?, ?, ?, 0, NULL, ?)",
        )
        .bind(message_id.to_string())
        .bind(thread_id.to_string())
        .bind(sender_id.to_string())
        .bind(content.clone())
        .bind(now)
        .execute(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-send-insert",
        })?;

        sqlx::query(
            "UPDATE message_threads SET last_message_content = ?, last_message_at = ?, last_message_sender_id = ? WHERE id = ?",
        )
        .bind(content.clone())
        .bind(now)
        .bind(sender_id.to_string())
        .bind(thread_id.to_string())
        .execute(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-send-touch-thread",
        })?;

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "message-send-commit",
        })?;

        let message = MessageRecord {
            id: message_id,
            thread_id,
            sender_id,
            content,
            is_read: false,
            read_at_unix_ms: None,
            created_at_unix_ms: i64_to_u64(now, "message-send-created-at")?,
        };

        let delivered = self
            .feed
            .publish(FeedEvent::MessageInserted(message.clone()));
        tracing::debug!(
            thread = %thread_id,
            message = %message_id,
            delivered,
            "message persisted"
        );

        Ok(SendReceipt { message, thread_id })
    }

    async fn mark_read_inner(&self, message_ids: Vec<MessageId>) -> StorageResult<()> {
        if message_ids.is_empty() {
            return Ok(());
        }

        let now = unix_timestamp_ms();
        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "message-mark-read-begin",
        })?;

        let mut updated = Vec::new();
        for message_id in message_ids {
            let result = sqlx::query(
                "UPDATE messages SET is_read = 1, read_at = ? WHERE id = ? AND is_read = 0",
            )
            .bind(now)
            .bind(message_id.to_string())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-mark-read-apply",
            })?;

            // Already-read or unknown ids are skipped so repeated calls stay idempotent.
            if result.rows_affected() == 0 {
                continue;
            }

            let row = sqlx::query_as::<_, MessageRow>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
            ))
            .bind(message_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-mark-read-load",
            })?;
            updated.push(message_row_to_record(row)?);
        }

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "message-mark-read-commit",
        })?;

        for message in updated {
            self.feed.publish(FeedEvent::MessageUpdated(message));
        }

        Ok(())
    }
}

impl ThreadStore for SqliteStorage {
    fn list_threads<'a>(
        &'a self,
        viewer: UserId,
    ) -> BoxFuture<'a, StorageResult<Vec<ThreadSummary>>> {
        Box::pin(async move {
            let mut connection = self.pool.acquire().await.context(SqliteQuerySnafu {
                stage: "thread-list-acquire",
            })?;
            let viewer_raw = viewer.to_string();
            let rows = sqlx::query_as::<_, ThreadListRow>(
                "SELECT t.id, t.thread_type, t.participant_1, t.participant_2, t.last_message_content, t.last_message_at, t.created_at, \
                 (SELECT COUNT(*) FROM messages m WHERE m.thread_id = t.id AND m.sender_id != ? AND m.is_read = 0) AS unread_count \
                 FROM message_threads t \
                 WHERE t.participant_1 = ? OR t.participant_2 = ? \
                 ORDER BY t.last_message_at IS NULL, t.last_message_at DESC, t.created_at DESC",
            )
            .bind(viewer_raw.clone())
            .bind(viewer_raw.clone())
            .bind(viewer_raw)
            .fetch_all(&mut *connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "thread-list-query",
            })?;

            let mut summaries = Vec::with_capacity(rows.len());
            for row in rows {
                let unread_count = i64_to_u32(row.unread_count, "thread-list-unread-count")?;
                let thread = thread_row_to_record(row.thread)?;
                let partner = load_user(&mut connection, thread.partner_of(viewer)).await?;
                summaries.push(ThreadSummary {
                    thread,
                    partner,
                    unread_count,
                });
            }

            Ok(summaries)
        })
    }
}

impl MessageStore for SqliteStorage {
    fn list_messages<'a>(
        &'a self,
        thread_id: ThreadId,
        page: MessagePage,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let mut connection = self.pool.acquire().await.context(SqliteQuerySnafu {
                stage: "message-list-acquire",
            })?;
            load_thread(&mut connection, thread_id, "message-list-thread-missing").await?;

            let before_at = page
                .before
                .map(|cursor| u64_to_i64(cursor.created_at_unix_ms, "message-list-before"))
                .transpose()?;
            let before_id = page.before.map(|cursor| cursor.message_id.to_string());
            // Ids are v7 uuids in lowercase text, so they order like their bytes.
            let rows = sqlx::query_as::<_, MessageRow>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = ? \
                 AND (? IS NULL OR created_at < ? OR (created_at = ? AND id < ?)) \
                 ORDER BY created_at DESC, id DESC LIMIT ?"
            ))
            .bind(thread_id.to_string())
            .bind(before_at)
            .bind(before_at)
            .bind(before_at)
            .bind(before_id)
            .bind(i64::from(page.limit))
            .fetch_all(&mut *connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            // Query walks newest-first to honor the limit; callers want chronological order.
            let mut messages = rows
                .into_iter()
                .map(message_row_to_record)
                .collect::<StorageResult<Vec<_>>>()?;
            messages.reverse();
            Ok(messages)
        })
    }

    fn send_message<'a>(
        &'a self,
        sender_id: UserId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<SendReceipt>> {
        Box::pin(self.send_message_inner(sender_id, input))
    }

    fn mark_read<'a>(&'a self, message_ids: Vec<MessageId>) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(self.mark_read_inner(message_ids))
    }
}

impl UserStore for SqliteStorage {
    fn get_user<'a>(
        &'a self,
        user_id: UserId,
    ) -> BoxFuture<'a, StorageResult<Option<UserRecord>>> {
        Box::pin(async move {
            let mut connection = self.pool.acquire().await.context(SqliteQuerySnafu {
                stage: "user-get-acquire",
            })?;
            load_user(&mut connection, user_id).await
        })
    }

    fn list_users<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<UserRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, UserRow>(&format!(
                "SELECT {USER_COLUMNS} FROM users ORDER BY email ASC"
            ))
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "user-list-query",
            })?;

            rows.into_iter().map(user_row_to_record).collect()
        })
    }
}

impl MessageFeed for SqliteStorage {
    fn subscribe(&self, thread_id: ThreadId) -> StorageResult<FeedSubscription> {
        Ok(self.feed.subscribe(thread_id))
    }
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: String,
    email: String,
    name: Option<String>,
    nickname: Option<String>,
    profile_name: Option<String>,
    role: String,
    tier: Option<String>,
}

#[derive(Debug, FromRow)]
struct ThreadRow {
    id: String,
    thread_type: String,
    participant_1: String,
    participant_2: String,
    last_message_content: Option<String>,
    last_message_at: Option<i64>,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct ThreadListRow {
    #[sqlx(flatten)]
    thread: ThreadRow,
    unread_count: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    thread_id: String,
    sender_id: String,
    content: String,
    is_read: bool,
    read_at: Option<i64>,
    created_at: i64,
}

fn user_row_to_record(row: UserRow) -> StorageResult<UserRecord> {
    Ok(UserRecord {
        id: UserId::parse(&row.id)?,
        email: row.email,
        name: row.name,
        nickname: row.nickname,
        profile_name: row.profile_name,
        role: UserRole::parse(&row.role),
        tier: row.tier.as_deref().and_then(Tier::parse),
    })
}

fn thread_row_to_record(row: ThreadRow) -> StorageResult<ThreadRecord> {
    Ok(ThreadRecord {
        id: ThreadId::parse(&row.id)?,
        kind: ThreadKind::parse(&row.thread_type).context(InvariantViolationSnafu {
            stage: "thread-row-kind",
            details: format!("unknown thread type '{}'", row.thread_type),
        })?,
        participant_1: UserId::parse(&row.participant_1)?,
        participant_2: UserId::parse(&row.participant_2)?,
        last_message_content: row.last_message_content,
        last_message_at_unix_ms: row
            .last_message_at
            .map(|value| i64_to_u64(value, "thread-row-last-message-at"))
            .transpose()?,
        created_at_unix_ms: i64_to_u64(row.created_at, "thread-row-created-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        thread_id: ThreadId::parse(&row.thread_id)?,
        sender_id: UserId::parse(&row.sender_id)?,
        content: row.content,
        is_read: row.is_read,
        read_at_unix_ms: row
            .read_at
            .map(|value| i64_to_u64(value, "message-row-read-at"))
            .transpose()?,
        created_at_unix_ms: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

async fn load_user(
    connection: &mut SqliteConnection,
    user_id: UserId,
) -> StorageResult<Option<UserRecord>> {
    let row = sqlx::query_as::<_, UserRow>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE id = ?"
    ))
    .bind(user_id.to_string())
    .fetch_optional(&mut *connection)
    .await
    .context(SqliteQuerySnafu {
        stage: "user-load-query",
    })?;

    row.map(user_row_to_record).transpose()
}

async fn load_thread(
    connection: &mut SqliteConnection,
    thread_id: ThreadId,
    stage: &'static str,
) -> StorageResult<ThreadRecord> {
    let row = sqlx::query_as::<_, ThreadRow>(&format!(
        "SELECT {THREAD_COLUMNS} FROM message_threads WHERE id = ?"
    ))
    .bind(thread_id.to_string())
    .fetch_optional(&mut *connection)
    .await
    .context(SqliteQuerySnafu { stage })?
    .context(NotFoundSnafu {
        stage,
        entity: "thread",
        id: thread_id.to_string(),
    })?;

    thread_row_to_record(row)
}

async fn ensure_user_exists(
    connection: &mut SqliteConnection,
    user_id: UserId,
    stage: &'static str,
) -> StorageResult<()> {
    let existing = sqlx::query_scalar::<_, i64>("SELECT 1 FROM users WHERE id = ? LIMIT 1")
        .bind(user_id.to_string())
        .fetch_optional(&mut *connection)
        .await
        .context(SqliteQuerySnafu { stage })?;

    if existing.is_none() {
        return NotFoundSnafu {
            stage,
            entity: "user",
            id: user_id.to_string(),
        }
        .fail();
    }

    Ok(())
}

async fn get_or_create_thread_id(
    connection: &mut SqliteConnection,
    kind: ThreadKind,
    user_a: UserId,
    user_b: UserId,
) -> StorageResult<ThreadId> {
    ensure!(
        user_a != user_b,
        RejectedSnafu {
            stage: "thread-get-or-create-validate",
            reason: "a thread needs two distinct participants".to_string(),
        }
    );

    // Participants are stored as an ordered pair so (a, b) and (b, a) resolve to one row.
    let (first, second) = ordered_pair(user_a, user_b);

    let existing = sqlx::query_scalar::<_, String>(
        "SELECT id FROM message_threads WHERE participant_1 = ? AND participant_2 = ? AND thread_type = ?",
    )
    .bind(first.clone())
    .bind(second.clone())
    .bind(kind.as_str())
    .fetch_optional(&mut *connection)
    .await
    .context(SqliteQuerySnafu {
        stage: "thread-get-or-create-lookup",
    })?;

    if let Some(existing) = existing {
        return ThreadId::parse(&existing);
    }

    let thread_id = ThreadId::new_v7();
    sqlx::query(
        "INSERT INTO message_threads (id, thread_type, participant_1, participant_2, last_message_content, last_message_at, last_message_sender_id, created_at) VALUES (?, ?, ?, ?, NULL, NULL, NULL, ?)",
    )
    .bind(thread_id.to_string())
    .bind(kind.as_str())
    .bind(first)
    .bind(second)
    .bind(unix_timestamp_ms())
    .execute(&mut *connection)
    .await
    .context(SqliteQuerySnafu {
        stage: "thread-get-or-create-insert",
    })?;

    tracing::debug!(thread = %thread_id, kind = kind.as_str(), "thread created");
    Ok(thread_id)
}

fn ordered_pair(user_a: UserId, user_b: UserId) -> (String, String) {
    let (a, b) = (user_a.to_string(), user_b.to_string());
    if a <= b { (a, b) } else { (b, a) }
}

fn unix_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn i64_to_u32(value: i64, stage: &'static str) -> StorageResult<u32> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("sqlite integer '{value}' cannot map to u32"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
