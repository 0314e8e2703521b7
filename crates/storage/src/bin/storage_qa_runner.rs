use std::collections::HashSet;
use std::env;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu};

use farmchat_storage::{
    FeedEvent, MessageCursor, MessageFeed, MessageId, MessagePage, MessageStore, NewMessage,
    NewUser, SqliteStorage, StorageError, ThreadId, ThreadStore, UserId, UserRecord, UserRole,
};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    IdRoundtrip,
    IdInvalid,
    SchemaInit,
    SendCreatesThread,
    SelfSendRejected,
    UnreadCounts,
    FeedDelivery,
    Paging,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "id_roundtrip" => Some(Self::IdRoundtrip),
            "id_invalid" => Some(Self::IdInvalid),
            "schema_init" => Some(Self::SchemaInit),
            "send_creates_thread" => Some(Self::SendCreatesThread),
            "self_send_rejected" => Some(Self::SelfSendRejected),
            "unread_counts" => Some(Self::UnreadCounts),
            "feed_delivery" => Some(Self::FeedDelivery),
            "paging" => Some(Self::Paging),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::IdRoundtrip => "id_roundtrip",
            Self::IdInvalid => "id_invalid",
            Self::SchemaInit => "schema_init",
            Self::SendCreatesThread => "send_creates_thread",
            Self::SelfSendRejected => "self_send_rejected",
            Self::UnreadCounts => "unread_counts",
            Self::FeedDelivery => "feed_delivery",
            Self::Paging => "paging",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("storage validation failed: {source}"))]
    StorageValidation {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("missing required --db argument for scenario '{scenario}'"))]
    MissingDbPath {
        stage: &'static str,
        scenario: &'static str,
    },
    #[snafu(display("sqlite query failed: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Logs go to stderr so stdout stays a clean key=value report.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());
    if let Some(db_path) = args.db_path.as_deref() {
        println!("db_path={db_path}");
    }

    match args.scenario {
        Scenario::IdRoundtrip => run_id_roundtrip(),
        Scenario::IdInvalid => run_id_invalid(),
        Scenario::SchemaInit => run_schema_init(require_db_path(&args, "schema_init")?).await,
        Scenario::SendCreatesThread => {
            run_send_creates_thread(require_db_path(&args, "send_creates_thread")?).await
        }
        Scenario::SelfSendRejected => {
            run_self_send_rejected(require_db_path(&args, "self_send_rejected")?).await
        }
        Scenario::UnreadCounts => {
            run_unread_counts(require_db_path(&args, "unread_counts")?).await
        }
        Scenario::FeedDelivery => {
            run_feed_delivery(require_db_path(&args, "feed_delivery")?).await
        }
        Scenario::Paging => run_paging(require_db_path(&args, "paging")?).await,
        Scenario::All => run_all(args.db_path.as_deref()).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_path = Some(value);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_path,
    })
}

fn require_db_path<'a>(args: &'a RunnerArgs, scenario: &'static str) -> RunnerResult<&'a str> {
    args.db_path.as_deref().context(MissingDbPathSnafu {
        stage: "require-db-path",
        scenario,
    })
}

fn run_id_roundtrip() -> RunnerResult<()> {
    let user_id = UserId::new_v7();
    let thread_id = ThreadId::new_v7();
    let message_id = MessageId::new_v7();

    let roundtrip_ok = UserId::parse(&user_id.to_string()).ok() == Some(user_id)
        && ThreadId::parse(&thread_id.to_string()).ok() == Some(thread_id)
        && MessageId::parse(&message_id.to_string()).ok() == Some(message_id);

    println!("id_roundtrip={roundtrip_ok}");
    if !roundtrip_ok {
        return ScenarioFailedSnafu {
            stage: "scenario-id-roundtrip",
            scenario: "id_roundtrip",
            reason: "an id wrapper did not survive a string round-trip".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

fn run_id_invalid() -> RunnerResult<()> {
    let invalid_input = "not-a-valid-uuid";
    let invalid_id_error = UserId::parse(invalid_input).is_err()
        && ThreadId::parse(invalid_input).is_err()
        && MessageId::parse(invalid_input).is_err();

    println!("invalid_id_error={invalid_id_error}");
    if !invalid_id_error {
        return ScenarioFailedSnafu {
            stage: "scenario-id-invalid",
            scenario: "id_invalid",
            reason: "at least one id wrapper accepted malformed uuid input".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_all(db_path: Option<&str>) -> RunnerResult<()> {
    run_id_roundtrip()?;
    run_id_invalid()?;

    if let Some(path) = db_path {
        run_schema_init(path).await?;
        run_send_creates_thread(path).await?;
        run_self_send_rejected(path).await?;
        run_unread_counts(path).await?;
        run_feed_delivery(path).await?;
        run_paging(path).await?;
    }

    println!("all_passed=true");
    Ok(())
}

async fn open_storage(db_path: &str, stage: &'static str) -> RunnerResult<SqliteStorage> {
    SqliteStorage::open(db_path)
        .await
        .context(StorageValidationSnafu { stage })
}

// Emails are unique per run so scenarios can share one database file.
async fn seed_user(
    storage: &SqliteStorage,
    label: &str,
    stage: &'static str,
) -> RunnerResult<UserRecord> {
    storage
        .create_user(NewUser {
            email: format!("{label}-{}@qa.farmchat.local", UserId::new_v7()),
            name: Some(label.to_string()),
            role: UserRole::Member,
            ..NewUser::default()
        })
        .await
        .context(StorageValidationSnafu { stage })
}

async fn send(
    storage: &SqliteStorage,
    from: UserId,
    to: UserId,
    content: &str,
    stage: &'static str,
) -> RunnerResult<farmchat_storage::SendReceipt> {
    storage
        .send_message(
            from,
            NewMessage {
                receiver_id: to,
                content: content.to_string(),
            },
        )
        .await
        .context(StorageValidationSnafu { stage })
}

async fn run_schema_init(db_path: &str) -> RunnerResult<()> {
    let storage = open_storage(db_path, "scenario-schema-init-open").await?;
    let pool = storage.pool();

    let discovered_tables = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('users', 'message_threads', 'messages')",
    )
    .fetch_all(pool)
    .await
    .context(SqliteQuerySnafu {
        stage: "scenario-schema-init-list-tables",
    })?;

    let required_tables = ["users", "message_threads", "messages"];
    let available_tables: HashSet<String> = discovered_tables.into_iter().collect();
    let schema_ok = required_tables
        .iter()
        .all(|table_name| available_tables.contains(*table_name));

    let journal_mode = sqlx::query_scalar::<_, String>("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-schema-init-journal-mode",
        })?
        .to_lowercase();
    let foreign_keys = sqlx::query_scalar::<_, i64>("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-schema-init-foreign-keys",
        })?;

    println!("schema_ok={schema_ok}");
    println!("journal_mode={journal_mode}");
    println!("foreign_keys={foreign_keys}");

    if !schema_ok {
        return ScenarioFailedSnafu {
            stage: "scenario-schema-init-assert-schema",
            scenario: "schema_init",
            reason: "expected messaging tables are missing".to_string(),
        }
        .fail();
    }

    if journal_mode != "wal" {
        return ScenarioFailedSnafu {
            stage: "scenario-schema-init-assert-journal-mode",
            scenario: "schema_init",
            reason: format!("expected journal_mode=wal but was {journal_mode}"),
        }
        .fail();
    }

    if foreign_keys != 1 {
        return ScenarioFailedSnafu {
            stage: "scenario-schema-init-assert-foreign-keys",
            scenario: "schema_init",
            reason: format!("expected foreign_keys=1 but was {foreign_keys}"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_send_creates_thread(db_path: &str) -> RunnerResult<()> {
    let storage = open_storage(db_path, "scenario-send-creates-thread-open").await?;
    let seller = seed_user(&storage, "seller", "scenario-send-creates-thread-seed").await?;
    let buyer = seed_user(&storage, "buyer", "scenario-send-creates-thread-seed").await?;

    let first = send(
        &storage,
        buyer.id,
        seller.id,
        "is the honey still available?",
        "scenario-send-creates-thread-first",
    )
    .await?;
    let reply = send(
        &storage,
        seller.id,
        buyer.id,
        "yes, two jars left",
        "scenario-send-creates-thread-reply",
    )
    .await?;

    let thread_reused = first.thread_id == reply.thread_id;
    let threads = storage
        .list_threads(buyer.id)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-send-creates-thread-list",
        })?;
    let preview_ok = threads.len() == 1
        && threads[0].thread.last_message_content.as_deref() == Some("yes, two jars left");

    println!("thread_reused={thread_reused}");
    println!("preview_ok={preview_ok}");

    if !thread_reused || !preview_ok {
        return ScenarioFailedSnafu {
            stage: "scenario-send-creates-thread-assert",
            scenario: "send_creates_thread",
            reason: format!("thread_reused={thread_reused} preview_ok={preview_ok}"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_self_send_rejected(db_path: &str) -> RunnerResult<()> {
    let storage = open_storage(db_path, "scenario-self-send-open").await?;
    let user = seed_user(&storage, "solo", "scenario-self-send-seed").await?;

    let outcome = storage
        .send_message(
            user.id,
            NewMessage {
                receiver_id: user.id,
                content: "talking to myself".to_string(),
            },
        )
        .await;
    let rejected = matches!(outcome, Err(ref error) if error.is_rejection());

    let thread_count = storage
        .list_threads(user.id)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-self-send-list",
        })?
        .len();

    println!("self_send_rejected={rejected}");
    println!("thread_count={thread_count}");

    if !rejected || thread_count != 0 {
        return ScenarioFailedSnafu {
            stage: "scenario-self-send-assert",
            scenario: "self_send_rejected",
            reason: format!("rejected={rejected} thread_count={thread_count}"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_unread_counts(db_path: &str) -> RunnerResult<()> {
    let storage = open_storage(db_path, "scenario-unread-open").await?;
    let seller = seed_user(&storage, "seller", "scenario-unread-seed").await?;
    let buyer = seed_user(&storage, "buyer", "scenario-unread-seed").await?;

    let mut sent = Vec::new();
    for content in ["order placed", "shipping tomorrow", "tracking attached"] {
        sent.push(send(&storage, seller.id, buyer.id, content, "scenario-unread-send").await?);
    }

    let unread_before = total_unread(&storage, buyer.id).await?;
    let seller_unread = total_unread(&storage, seller.id).await?;

    storage
        .mark_read(sent.iter().take(2).map(|receipt| receipt.message.id).collect())
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-unread-mark-read",
        })?;
    let unread_after = total_unread(&storage, buyer.id).await?;

    println!("unread_before={unread_before}");
    println!("unread_after={unread_after}");
    println!("sender_unread={seller_unread}");

    if unread_before != 3 || unread_after != 1 || seller_unread != 0 {
        return ScenarioFailedSnafu {
            stage: "scenario-unread-assert",
            scenario: "unread_counts",
            reason: format!(
                "expected 3/1/0 but saw {unread_before}/{unread_after}/{seller_unread}"
            ),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn total_unread(storage: &SqliteStorage, viewer: UserId) -> RunnerResult<u32> {
    let threads = storage
        .list_threads(viewer)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-unread-list",
        })?;
    Ok(threads.iter().map(|summary| summary.unread_count).sum())
}

async fn run_feed_delivery(db_path: &str) -> RunnerResult<()> {
    let storage = open_storage(db_path, "scenario-feed-open").await?;
    let seller = seed_user(&storage, "seller", "scenario-feed-seed").await?;
    let buyer = seed_user(&storage, "buyer", "scenario-feed-seed").await?;

    let opener = send(&storage, buyer.id, seller.id, "hello", "scenario-feed-open-thread").await?;
    let mut subscription =
        storage
            .subscribe(opener.thread_id)
            .context(StorageValidationSnafu {
                stage: "scenario-feed-subscribe",
            })?;

    let reply = send(&storage, seller.id, buyer.id, "hi there", "scenario-feed-reply").await?;
    let received = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .ok()
        .flatten();
    let insert_delivered = matches!(
        received,
        Some(FeedEvent::MessageInserted(ref message)) if message.id == reply.message.id
    );

    subscription.cancel();
    send(&storage, seller.id, buyer.id, "after cancel", "scenario-feed-after-cancel").await?;
    let silent_after_cancel = subscription.try_recv().is_none();

    println!("insert_delivered={insert_delivered}");
    println!("silent_after_cancel={silent_after_cancel}");

    if !insert_delivered || !silent_after_cancel {
        return ScenarioFailedSnafu {
            stage: "scenario-feed-assert",
            scenario: "feed_delivery",
            reason: format!(
                "insert_delivered={insert_delivered} silent_after_cancel={silent_after_cancel}"
            ),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_paging(db_path: &str) -> RunnerResult<()> {
    let storage = open_storage(db_path, "scenario-paging-open").await?;
    let seller = seed_user(&storage, "seller", "scenario-paging-seed").await?;
    let buyer = seed_user(&storage, "buyer", "scenario-paging-seed").await?;

    let mut thread_id = None;
    for index in 0..6 {
        let receipt = send(
            &storage,
            seller.id,
            buyer.id,
            &format!("price update {index}"),
            "scenario-paging-send",
        )
        .await?;
        thread_id = Some(receipt.thread_id);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let thread_id = thread_id.context(ScenarioFailedSnafu {
        stage: "scenario-paging-thread",
        scenario: "paging",
        reason: "no thread was created".to_string(),
    })?;

    let latest = storage
        .list_messages(thread_id, MessagePage::latest(4))
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-paging-latest",
        })?;
    let cursor = latest
        .first()
        .map(MessageCursor::of)
        .context(ScenarioFailedSnafu {
            stage: "scenario-paging-cursor",
            scenario: "paging",
            reason: "latest page was empty".to_string(),
        })?;
    let older = storage
        .list_messages(thread_id, MessagePage::before(4, cursor))
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-paging-older",
        })?;

    let chronological = latest
        .windows(2)
        .all(|pair| pair[0].created_at_unix_ms <= pair[1].created_at_unix_ms);

    println!("latest_len={}", latest.len());
    println!("older_len={}", older.len());
    println!("chronological={chronological}");

    if latest.len() != 4 || older.len() != 2 || !chronological {
        return ScenarioFailedSnafu {
            stage: "scenario-paging-assert",
            scenario: "paging",
            reason: format!(
                "latest_len={} older_len={} chronological={chronological}",
                latest.len(),
                older.len()
            ),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}
