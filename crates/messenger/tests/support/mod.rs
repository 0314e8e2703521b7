#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use farmchat::{SessionEvent, SessionEvents};
use farmchat_storage::{
    BoxFuture, FeedEvent, FeedHub, FeedSubscription, MessageCursor, MessageFeed, MessageId,
    MessagePage, MessageRecord, MessageStore, NewMessage, SendReceipt, StorageError,
    StorageResult, ThreadId, ThreadKind, ThreadRecord, ThreadStore, ThreadSummary, Tier, UserId,
    UserRecord, UserRole, UserStore,
};
use tokio::sync::Notify;

const CLOCK_START_MS: u64 = 1_700_000_000_000;

/// In-memory stand-in for the messaging collaborators with switchable failures.
#[derive(Default)]
pub struct FakeBackend {
    users: Mutex<HashMap<UserId, UserRecord>>,
    threads: Mutex<Vec<ThreadRecord>>,
    messages: Mutex<Vec<MessageRecord>>,
    feed: FeedHub,
    clock: AtomicU64,
    send_gate: Mutex<Option<Arc<Notify>>>,
    response_gate: Mutex<Option<Arc<Notify>>>,
    listing_gate: Mutex<Option<Arc<Notify>>>,
    fail_sends: AtomicBool,
    reject_sends: AtomicBool,
    fail_listing: AtomicBool,
    fail_subscribe: AtomicBool,
    marked_read: Mutex<Vec<MessageId>>,
    send_calls: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_user(&self, email: &str, role: UserRole) -> UserRecord {
        let record = UserRecord {
            id: UserId::new_v7(),
            email: email.to_string(),
            name: None,
            nickname: None,
            profile_name: None,
            role,
            tier: None,
        };
        lock(&self.users).insert(record.id, record.clone());
        record
    }

    pub fn add_seller(&self, email: &str, profile_name: &str, tier: Tier) -> UserRecord {
        let mut record = self.add_user(email, UserRole::Seller);
        record.profile_name = Some(profile_name.to_string());
        record.tier = Some(tier);
        lock(&self.users).insert(record.id, record.clone());
        record
    }

    pub fn seed_thread(&self, kind: ThreadKind, a: UserId, b: UserId) -> ThreadId {
        let record = ThreadRecord {
            id: ThreadId::new_v7(),
            kind,
            participant_1: a,
            participant_2: b,
            last_message_content: None,
            last_message_at_unix_ms: None,
            created_at_unix_ms: self.tick(),
        };
        let thread_id = record.id;
        lock(&self.threads).push(record);
        thread_id
    }

    /// Stores a message without publishing it.
    pub fn seed_message(
        &self,
        thread_id: ThreadId,
        sender_id: UserId,
        content: &str,
        is_read: bool,
    ) -> MessageRecord {
        let created_at_unix_ms = self.tick();
        self.seed_message_at(thread_id, sender_id, content, is_read, created_at_unix_ms)
    }

    /// Stores a message with a fixed timestamp, which may repeat.
    pub fn seed_message_at(
        &self,
        thread_id: ThreadId,
        sender_id: UserId,
        content: &str,
        is_read: bool,
        created_at_unix_ms: u64,
    ) -> MessageRecord {
        let record = MessageRecord {
            id: MessageId::new_v7(),
            thread_id,
            sender_id,
            content: content.to_string(),
            is_read,
            read_at_unix_ms: is_read.then_some(CLOCK_START_MS),
            created_at_unix_ms,
        };
        self.store_message(record.clone());
        record
    }

    /// Stores a message from `sender_id` and pushes it to live subscribers.
    pub fn deliver(&self, thread_id: ThreadId, sender_id: UserId, content: &str) -> MessageRecord {
        let record = self.seed_message(thread_id, sender_id, content, false);
        self.feed.publish(FeedEvent::MessageInserted(record.clone()));
        record
    }

    /// Pushes an already stored message again, as a flaky transport would.
    pub fn republish(&self, record: &MessageRecord) -> usize {
        self.feed.publish(FeedEvent::MessageInserted(record.clone()))
    }

    pub fn message(&self, message_id: MessageId) -> Option<MessageRecord> {
        lock(&self.messages)
            .iter()
            .find(|message| message.id == message_id)
            .cloned()
    }

    pub fn thread_count(&self) -> usize {
        lock(&self.threads).len()
    }

    /// Parks every send until the returned gate is notified.
    pub fn hold_sends(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.send_gate) = Some(gate.clone());
        gate
    }

    /// Persists and publishes sends, then parks the response until the gate is notified.
    pub fn hold_send_responses(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.response_gate) = Some(gate.clone());
        gate
    }

    /// Parks every message listing until the returned gate is notified.
    pub fn hold_message_listings(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.listing_gate) = Some(gate.clone());
        gate
    }

    pub fn set_fail_sends(&self, value: bool) {
        self.fail_sends.store(value, Ordering::SeqCst);
    }

    pub fn set_reject_sends(&self, value: bool) {
        self.reject_sends.store(value, Ordering::SeqCst);
    }

    pub fn set_fail_listing(&self, value: bool) {
        self.fail_listing.store(value, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, value: bool) {
        self.fail_subscribe.store(value, Ordering::SeqCst);
    }

    pub fn active_subscriptions(&self) -> Vec<ThreadId> {
        self.feed.active_subscriptions()
    }

    pub fn marked_read(&self) -> Vec<MessageId> {
        lock(&self.marked_read).clone()
    }

    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    fn tick(&self) -> u64 {
        CLOCK_START_MS + self.clock.fetch_add(1, Ordering::SeqCst) * 1_000
    }

    fn store_message(&self, record: MessageRecord) {
        if let Some(thread) = lock(&self.threads)
            .iter_mut()
            .find(|thread| thread.id == record.thread_id)
        {
            thread.last_message_content = Some(record.content.clone());
            thread.last_message_at_unix_ms = Some(record.created_at_unix_ms);
        }
        lock(&self.messages).push(record);
    }

    fn listing_guard(&self, stage: &'static str) -> StorageResult<()> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                stage,
                details: "listing endpoint offline".to_string(),
            });
        }
        Ok(())
    }

    fn find_direct_thread(&self, a: UserId, b: UserId) -> Option<ThreadId> {
        lock(&self.threads)
            .iter()
            .find(|thread| {
                thread.kind == ThreadKind::UserToUser
                    && ((thread.participant_1 == a && thread.participant_2 == b)
                        || (thread.participant_1 == b && thread.participant_2 == a))
            })
            .map(|thread| thread.id)
    }

    fn persist_send(&self, sender_id: UserId, input: NewMessage) -> StorageResult<SendReceipt> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                stage: "fake-send",
                details: "connection reset".to_string(),
            });
        }
        let content = input.content.trim().to_string();
        if self.reject_sends.load(Ordering::SeqCst) || content.is_empty() {
            return Err(StorageError::Rejected {
                stage: "fake-send",
                reason: "message refused".to_string(),
            });
        }
        if sender_id == input.receiver_id {
            return Err(StorageError::Rejected {
                stage: "fake-send",
                reason: "cannot send a message to yourself".to_string(),
            });
        }

        let thread_id = self
            .find_direct_thread(sender_id, input.receiver_id)
            .unwrap_or_else(|| {
                self.seed_thread(ThreadKind::UserToUser, sender_id, input.receiver_id)
            });
        let message = self.seed_message(thread_id, sender_id, &content, false);
        self.feed
            .publish(FeedEvent::MessageInserted(message.clone()));
        Ok(SendReceipt { message, thread_id })
    }
}

impl ThreadStore for FakeBackend {
    fn list_threads<'a>(
        &'a self,
        viewer: UserId,
    ) -> BoxFuture<'a, StorageResult<Vec<ThreadSummary>>> {
        Box::pin(async move {
            self.listing_guard("fake-list-threads")?;
            let users = lock(&self.users).clone();
            let messages = lock(&self.messages).clone();
            let mut threads = lock(&self.threads)
                .iter()
                .filter(|thread| thread.participant_1 == viewer || thread.participant_2 == viewer)
                .cloned()
                .collect::<Vec<_>>();
            threads.sort_by(|a, b| b.last_message_at_unix_ms.cmp(&a.last_message_at_unix_ms));

            Ok(threads
                .into_iter()
                .map(|thread| {
                    let unread_count = messages
                        .iter()
                        .filter(|message| {
                            message.thread_id == thread.id
                                && message.sender_id != viewer
                                && !message.is_read
                        })
                        .count() as u32;
                    ThreadSummary {
                        partner: users.get(&thread.partner_of(viewer)).cloned(),
                        thread,
                        unread_count,
                    }
                })
                .collect())
        })
    }
}

impl MessageStore for FakeBackend {
    fn list_messages<'a>(
        &'a self,
        thread_id: ThreadId,
        page: MessagePage,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let gate = lock(&self.listing_gate).clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            self.listing_guard("fake-list-messages")?;
            let mut matching = lock(&self.messages)
                .iter()
                .filter(|message| message.thread_id == thread_id)
                .filter(|message| {
                    page.before
                        .is_none_or(|before| MessageCursor::of(message) < before)
                })
                .cloned()
                .collect::<Vec<_>>();
            matching.sort_by_key(MessageCursor::of);
            let skip = matching.len().saturating_sub(page.limit as usize);
            Ok(matching.split_off(skip))
        })
    }

    fn send_message<'a>(
        &'a self,
        sender_id: UserId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<SendReceipt>> {
        Box::pin(async move {
            self.send_calls.fetch_add(1, Ordering::SeqCst);
            let gate = lock(&self.send_gate).clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            let receipt = self.persist_send(sender_id, input)?;
            let gate = lock(&self.response_gate).clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            Ok(receipt)
        })
    }

    fn mark_read<'a>(&'a self, message_ids: Vec<MessageId>) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut updated = Vec::new();
            {
                let mut messages = lock(&self.messages);
                for message in messages.iter_mut() {
                    if message_ids.contains(&message.id) && !message.is_read {
                        message.is_read = true;
                        message.read_at_unix_ms = Some(CLOCK_START_MS);
                        updated.push(message.clone());
                    }
                }
            }
            lock(&self.marked_read).extend(message_ids);
            for message in updated {
                self.feed.publish(FeedEvent::MessageUpdated(message));
            }
            Ok(())
        })
    }
}

impl UserStore for FakeBackend {
    fn get_user<'a>(
        &'a self,
        user_id: UserId,
    ) -> BoxFuture<'a, StorageResult<Option<UserRecord>>> {
        Box::pin(async move { Ok(lock(&self.users).get(&user_id).cloned()) })
    }

    fn list_users<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<UserRecord>>> {
        Box::pin(async move {
            self.listing_guard("fake-list-users")?;
            let mut users = lock(&self.users).values().cloned().collect::<Vec<_>>();
            users.sort_by(|a, b| a.email.cmp(&b.email));
            Ok(users)
        })
    }
}

impl MessageFeed for FakeBackend {
    fn subscribe(&self, thread_id: ThreadId) -> StorageResult<FeedSubscription> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                stage: "fake-subscribe",
                details: "push channel refused".to_string(),
            });
        }
        Ok(self.feed.subscribe(thread_id))
    }
}

/// Polls `condition` until it holds, panicking after a couple of seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

pub fn drain(events: &mut SessionEvents) -> Vec<SessionEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
