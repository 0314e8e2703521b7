use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use farmchat_storage::MessageId;

use super::message::{Message, MessageKey, ThreadKey};

type Entries = HashMap<ThreadKey, Arc<Vec<Message>>>;

/// What `replace` did with the provisional entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// Provisional entry swapped for the authoritative one in place.
    Swapped,
    /// Authoritative message was already cached; the provisional entry was dropped.
    Merged,
    /// Provisional entry was gone; the authoritative message was appended.
    Appended,
    /// Neither entry needed to change.
    Unchanged,
}

/// Per-thread ordered message lists, the single source rendered to the user.
///
/// Every mutation is one synchronous read-modify-write over an immutable snapshot.
#[derive(Default)]
pub struct MessageCache {
    entries: ArcSwap<Entries>,
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a thread's messages; empty when nothing is cached.
    pub fn get(&self, thread: &ThreadKey) -> Arc<Vec<Message>> {
        self.entries.load().get(thread).cloned().unwrap_or_default()
    }

    pub fn contains(&self, thread: &ThreadKey) -> bool {
        self.entries.load().contains_key(thread)
    }

    pub fn set(&self, thread: ThreadKey, messages: Vec<Message>) {
        let messages = Arc::new(dedup_by_key(messages));
        self.entries.rcu(|current| {
            let mut next = Entries::clone(current);
            next.insert(thread, messages.clone());
            next
        });
        tracing::debug!(thread = %thread, "cache entry replaced");
    }

    /// Appends unless a message with the same key is already cached. Returns whether it was added.
    pub fn append(&self, thread: ThreadKey, message: Message) -> bool {
        let mut appended = false;
        self.mutate(thread, |messages| {
            appended = !contains_key(messages, &message.key);
            if appended {
                messages.push(message.clone());
            }
            appended
        });
        appended
    }

    /// Swaps the provisional entry `old` for its authoritative counterpart.
    pub fn replace(&self, thread: ThreadKey, old: &MessageKey, new: Message) -> ReplaceOutcome {
        let mut outcome = ReplaceOutcome::Unchanged;
        self.mutate(thread, |messages| {
            let old_index = messages.iter().position(|message| message.key == *old);
            let new_present = contains_key(messages, &new.key);
            outcome = match (old_index, new_present) {
                (Some(index), false) => {
                    messages[index] = new.clone();
                    ReplaceOutcome::Swapped
                }
                (Some(index), true) => {
                    messages.remove(index);
                    ReplaceOutcome::Merged
                }
                (None, false) => {
                    messages.push(new.clone());
                    ReplaceOutcome::Appended
                }
                (None, true) => ReplaceOutcome::Unchanged,
            };
            outcome != ReplaceOutcome::Unchanged
        });
        tracing::debug!(thread = %thread, old = %old, new = %new.key, ?outcome, "cache replace");
        outcome
    }

    pub fn remove(&self, thread: ThreadKey, key: &MessageKey) -> bool {
        let mut removed = false;
        self.mutate(thread, |messages| {
            let before = messages.len();
            messages.retain(|message| message.key != *key);
            removed = messages.len() != before;
            removed
        });
        removed
    }

    /// Moves everything under `from` to `to`, merging with what `to` already holds.
    /// The `from` entry ceases to exist. Returns how many messages were carried over.
    pub fn rekey(&self, from: ThreadKey, to: ThreadKey) -> usize {
        if from == to {
            return 0;
        }
        let mut moved = 0;
        self.entries.rcu(|current| {
            let mut next = Entries::clone(current);
            moved = 0;
            let Some(source) = next.remove(&from) else {
                return next;
            };
            let mut merged = next
                .get(&to)
                .map(|messages| messages.as_ref().clone())
                .unwrap_or_default();
            for message in source.iter() {
                if contains_key(&merged, &message.key) {
                    continue;
                }
                let mut message = message.clone();
                message.thread = to;
                merged.push(message);
                moved += 1;
            }
            next.insert(to, Arc::new(merged));
            next
        });
        tracing::debug!(from = %from, to = %to, moved, "cache entry rekeyed");
        moved
    }

    /// Puts an older page in front of the cached messages, skipping ones already present.
    pub fn prepend_older(&self, thread: ThreadKey, older: Vec<Message>) -> usize {
        let mut inserted = 0;
        self.mutate(thread, |messages| {
            let fresh = dedup_by_key(older.clone())
                .into_iter()
                .filter(|message| !contains_key(messages, &message.key))
                .collect::<Vec<_>>();
            inserted = fresh.len();
            if inserted == 0 {
                return false;
            }
            messages.splice(0..0, fresh);
            true
        });
        inserted
    }

    pub fn apply_read_state(
        &self,
        thread: ThreadKey,
        message_id: MessageId,
        is_read: bool,
        read_at_unix_ms: Option<u64>,
    ) -> bool {
        let key = MessageKey::Persisted(message_id);
        let mut changed = false;
        self.mutate(thread, |messages| {
            changed = false;
            if let Some(message) = messages.iter_mut().find(|message| message.key == key)
                && (message.is_read != is_read || message.read_at_unix_ms != read_at_unix_ms)
            {
                message.is_read = is_read;
                message.read_at_unix_ms = read_at_unix_ms;
                changed = true;
            }
            changed
        });
        changed
    }

    /// Full replace from a fetch that keeps in-flight sends visible.
    ///
    /// Outstanding provisional entries survive, as do persisted messages newer than
    /// the fetched page that arrived live while the fetch was running.
    pub fn replace_authoritative(&self, thread: ThreadKey, fetched: Vec<Message>) {
        let fetched = dedup_by_key(fetched);
        let newest_fetched = fetched
            .iter()
            .map(|message| message.created_at_unix_ms)
            .max();
        self.entries.rcu(|current| {
            let mut next = Entries::clone(current);
            let mut merged = fetched.clone();
            if let Some(existing) = current.get(&thread) {
                for message in existing.iter() {
                    let keep = match message.key {
                        MessageKey::Provisional(_) => true,
                        MessageKey::Persisted(_) => newest_fetched
                            .is_some_and(|newest| message.created_at_unix_ms > newest),
                    };
                    if keep && !contains_key(&merged, &message.key) {
                        merged.push(message.clone());
                    }
                }
            }
            next.insert(thread, Arc::new(merged));
            next
        });
        tracing::debug!(thread = %thread, "cache entry refreshed from fetch");
    }

    pub fn clear(&self) {
        self.entries.store(Arc::new(Entries::new()));
    }

    /// Applies `apply` to a copy of the thread's list and publishes it when `apply` returns true.
    fn mutate(&self, thread: ThreadKey, mut apply: impl FnMut(&mut Vec<Message>) -> bool) {
        self.entries.rcu(|current| {
            let mut messages = current
                .get(&thread)
                .map(|messages| messages.as_ref().clone())
                .unwrap_or_default();
            let mut next = Entries::clone(current);
            if apply(&mut messages) {
                next.insert(thread, Arc::new(messages));
            }
            next
        });
    }
}

fn contains_key(messages: &[Message], key: &MessageKey) -> bool {
    messages.iter().any(|message| message.key == *key)
}

fn dedup_by_key(messages: Vec<Message>) -> Vec<Message> {
    let mut unique: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        if !contains_key(&unique, &message.key) {
            unique.push(message);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use farmchat_storage::{MessageRecord, ThreadId, UserId};

    use super::*;
    use crate::chat::message::ProvisionalToken;

    fn persisted(thread: ThreadKey, content: &str, created_at: u64) -> Message {
        let thread_id = thread.persisted_id().unwrap_or_else(ThreadId::new_v7);
        let mut message = Message::from_record(
            MessageRecord {
                id: MessageId::new_v7(),
                thread_id,
                sender_id: UserId::new_v7(),
                content: content.to_string(),
                is_read: false,
                read_at_unix_ms: None,
                created_at_unix_ms: created_at,
            },
            None,
        );
        message.thread = thread;
        message
    }

    fn provisional(thread: ThreadKey, token: u64, content: &str) -> Message {
        Message::provisional(
            ProvisionalToken::new(token),
            thread,
            UserId::new_v7(),
            content,
            None,
        )
    }

    fn contents(cache: &MessageCache, thread: &ThreadKey) -> Vec<String> {
        cache
            .get(thread)
            .iter()
            .map(|message| message.content.clone())
            .collect()
    }

    #[test]
    fn append_is_idempotent_per_key() {
        let cache = MessageCache::new();
        let thread = ThreadKey::Persisted(ThreadId::new_v7());
        let message = persisted(thread, "hello", 1);

        assert!(cache.append(thread, message.clone()));
        assert!(!cache.append(thread, message));
        assert_eq!(cache.get(&thread).len(), 1);
    }

    #[test]
    fn replace_covers_swap_merge_and_append() {
        let cache = MessageCache::new();
        let thread = ThreadKey::Persisted(ThreadId::new_v7());
        let first = provisional(thread, 1, "one");
        let second = provisional(thread, 2, "two");
        cache.append(thread, first.clone());
        cache.append(thread, second.clone());

        let authoritative_first = persisted(thread, "one", 10);
        assert_eq!(
            cache.replace(thread, &first.key, authoritative_first.clone()),
            ReplaceOutcome::Swapped
        );
        assert_eq!(cache.get(&thread)[0].key, authoritative_first.key);

        // The live path delivered the second message before its send returned.
        let authoritative_second = persisted(thread, "two", 11);
        cache.append(thread, authoritative_second.clone());
        assert_eq!(
            cache.replace(thread, &second.key, authoritative_second.clone()),
            ReplaceOutcome::Merged
        );
        assert_eq!(contents(&cache, &thread), vec!["one", "two"]);

        let third = persisted(thread, "three", 12);
        assert_eq!(
            cache.replace(thread, &MessageKey::Provisional(ProvisionalToken::new(3)), third.clone()),
            ReplaceOutcome::Appended
        );
        assert_eq!(
            cache.replace(thread, &MessageKey::Provisional(ProvisionalToken::new(3)), third),
            ReplaceOutcome::Unchanged
        );
        assert_eq!(contents(&cache, &thread), vec!["one", "two", "three"]);
    }

    #[test]
    fn remove_rolls_back_only_the_target() {
        let cache = MessageCache::new();
        let thread = ThreadKey::Persisted(ThreadId::new_v7());
        let kept = persisted(thread, "kept", 1);
        let pending = provisional(thread, 7, "pending");
        cache.append(thread, kept);
        cache.append(thread, pending.clone());

        assert!(cache.remove(thread, &pending.key));
        assert!(!cache.remove(thread, &pending.key));
        assert_eq!(contents(&cache, &thread), vec!["kept"]);
    }

    #[test]
    fn rekey_merges_into_existing_entry_and_drops_the_source() {
        let cache = MessageCache::new();
        let partner = UserId::new_v7();
        let draft = ThreadKey::New { partner };
        let thread_id = ThreadId::new_v7();
        let promoted = ThreadKey::Persisted(thread_id);

        let sent = persisted(promoted, "first words", 5);
        let mut sent_in_draft = sent.clone();
        sent_in_draft.thread = draft;
        cache.append(draft, sent_in_draft);
        cache.append(promoted, sent);

        assert_eq!(cache.rekey(draft, promoted), 0);
        assert!(!cache.contains(&draft));
        assert_eq!(contents(&cache, &promoted), vec!["first words"]);

        let extra = provisional(draft, 9, "second");
        cache.append(draft, extra);
        assert_eq!(cache.rekey(draft, promoted), 1);
        let messages = cache.get(&promoted);
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|message| message.thread == promoted));
    }

    #[test]
    fn prepend_older_skips_known_messages() {
        let cache = MessageCache::new();
        let thread = ThreadKey::Persisted(ThreadId::new_v7());
        let boundary = persisted(thread, "boundary", 5);
        cache.set(thread, vec![boundary.clone(), persisted(thread, "latest", 6)]);

        let inserted = cache.prepend_older(
            thread,
            vec![persisted(thread, "oldest", 3), persisted(thread, "older", 4), boundary],
        );

        assert_eq!(inserted, 2);
        assert_eq!(
            contents(&cache, &thread),
            vec!["oldest", "older", "boundary", "latest"]
        );
    }

    #[test]
    fn apply_read_state_reports_real_changes_only() {
        let cache = MessageCache::new();
        let thread = ThreadKey::Persisted(ThreadId::new_v7());
        let message = persisted(thread, "unread", 1);
        let id = message.key.persisted_id().expect("persisted id");
        cache.append(thread, message);

        assert!(cache.apply_read_state(thread, id, true, Some(99)));
        assert!(!cache.apply_read_state(thread, id, true, Some(99)));
        assert!(cache.get(&thread)[0].is_read);
        assert!(!cache.apply_read_state(thread, MessageId::new_v7(), true, None));
    }

    #[test]
    fn replace_authoritative_keeps_outstanding_sends_and_late_live_rows() {
        let cache = MessageCache::new();
        let thread = ThreadKey::Persisted(ThreadId::new_v7());
        let stale = persisted(thread, "stale", 1);
        let pending = provisional(thread, 4, "in flight");
        let live = persisted(thread, "arrived live", 50);
        cache.append(thread, stale);
        cache.append(thread, pending);
        cache.append(thread, live);

        cache.replace_authoritative(
            thread,
            vec![persisted(thread, "fetched a", 10), persisted(thread, "fetched b", 20)],
        );

        assert_eq!(
            contents(&cache, &thread),
            vec!["fetched a", "fetched b", "in flight", "arrived live"]
        );
    }

    #[test]
    fn clear_drops_every_thread() {
        let cache = MessageCache::new();
        let thread = ThreadKey::Persisted(ThreadId::new_v7());
        cache.append(thread, persisted(thread, "bye", 1));

        cache.clear();

        assert!(cache.get(&thread).is_empty());
        assert!(!cache.contains(&thread));
    }
}
