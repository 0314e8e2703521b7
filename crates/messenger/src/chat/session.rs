use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use farmchat_storage::{Backend, MessageCursor, MessagePage, MessageRecord, ThreadId, UserId};
use snafu::{ResultExt, ensure};

use super::cache::MessageCache;
use super::directory::{PollingHandle, ThreadDirectory};
use super::events::{EventSink, SendNotice, SessionEvent, SessionEvents, event_channel};
use super::live::LiveSubscriber;
use super::message::{Message, Thread, ThreadKey};
use super::partners::{Partner, PartnerDirectory};
use super::send::{Composer, InFlight, SendOutcome, SendPipeline};
use super::unread::UnreadSummary;
use crate::error::{
    FetchResult, ListingSnafu, NoOpenThreadSnafu, SelfConversationSnafu, SendResult,
};
use crate::settings::ChatSettings;

/// Read projection of the open conversation.
#[derive(Debug, Clone)]
pub struct ThreadView {
    pub thread: Option<Thread>,
    pub messages: Arc<Vec<Message>>,
    pub has_more: bool,
    pub sending: bool,
}

/// One mounted chat widget: owns the caches, the live feed and the navigation state.
pub struct ChatSession {
    viewer: UserId,
    settings: ChatSettings,
    backend: Arc<dyn Backend>,
    events: EventSink,
    partners: Arc<PartnerDirectory>,
    directory: Arc<ThreadDirectory>,
    cache: Arc<MessageCache>,
    composer: Arc<Composer>,
    sends: SendPipeline,
    live: Arc<LiveSubscriber>,
    open: ArcSwap<Option<Thread>>,
    has_more: ArcSwap<HashMap<ThreadId, bool>>,
    loading_older: InFlight<ThreadId>,
    polling: Mutex<Option<PollingHandle>>,
}

impl ChatSession {
    pub fn new(
        backend: Arc<dyn Backend>,
        viewer: UserId,
        settings: ChatSettings,
    ) -> (Self, SessionEvents) {
        let settings = settings.normalized();
        let (events, receiver) = event_channel();
        let partners = Arc::new(PartnerDirectory::new(backend.clone(), viewer));
        let directory = Arc::new(ThreadDirectory::new(
            backend.clone(),
            viewer,
            partners.clone(),
            events.clone(),
            settings.badge_filter(),
        ));
        let cache = Arc::new(MessageCache::new());
        let composer = Arc::new(Composer::new());
        let sends = SendPipeline::new(
            backend.clone(),
            viewer,
            cache.clone(),
            composer.clone(),
            partners.clone(),
            settings.send_timeout(),
        );
        let live = Arc::new(LiveSubscriber::new(
            backend.clone(),
            viewer,
            cache.clone(),
            partners.clone(),
            directory.clone(),
            events.clone(),
        ));

        let session = Self {
            viewer,
            settings,
            backend,
            events,
            partners,
            directory,
            cache,
            composer,
            sends,
            live,
            open: ArcSwap::from_pointee(None),
            has_more: ArcSwap::from_pointee(HashMap::new()),
            loading_older: InFlight::default(),
            polling: Mutex::new(None),
        };
        (session, receiver)
    }

    pub fn viewer(&self) -> UserId {
        self.viewer
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    pub fn threads(&self) -> Arc<Vec<Thread>> {
        self.directory.threads()
    }

    pub fn unread(&self) -> Arc<UnreadSummary> {
        self.directory.unread()
    }

    pub fn contacts(&self) -> Arc<Vec<Partner>> {
        self.partners.contacts()
    }

    pub fn search_contacts(&self, query: &str) -> Vec<Partner> {
        self.partners.search(query)
    }

    pub fn messages(&self, thread: &ThreadKey) -> Arc<Vec<Message>> {
        self.cache.get(thread)
    }

    pub fn current_thread(&self) -> Option<Thread> {
        Option::clone(&self.open.load())
    }

    pub fn open_thread_key(&self) -> Option<ThreadKey> {
        self.current_thread().map(|thread| thread.key)
    }

    pub fn subscribed_thread(&self) -> Option<ThreadId> {
        self.live.subscribed_thread()
    }

    pub fn is_polling(&self) -> bool {
        self.lock_polling()
            .as_ref()
            .is_some_and(PollingHandle::is_running)
    }

    pub fn view(&self) -> ThreadView {
        let Some(thread) = self.current_thread() else {
            return ThreadView {
                thread: None,
                messages: Arc::default(),
                has_more: false,
                sending: false,
            };
        };

        let has_more = thread
            .persisted_id()
            .is_some_and(|thread_id| self.has_more_for(thread_id));
        ThreadView {
            messages: self.cache.get(&thread.key),
            sending: self.sends.is_sending(&thread.key),
            has_more,
            thread: Some(thread),
        }
    }

    /// Loads threads and contacts together, then keeps the thread list polled.
    pub async fn open_widget(&self) {
        let (threads, contacts) = futures::join!(self.refresh_threads(), self.refresh_contacts());
        tracing::debug!(
            threads_ok = threads.is_ok(),
            contacts_ok = contacts.is_ok(),
            "chat widget opened"
        );
        self.start_polling();
    }

    pub fn start_polling(&self) {
        let mut polling = self.lock_polling();
        if polling.as_ref().is_some_and(PollingHandle::is_running) {
            return;
        }
        *polling = Some(self.directory.spawn_polling(self.settings.poll_interval()));
    }

    pub async fn refresh_threads(&self) -> FetchResult<Arc<Vec<Thread>>> {
        self.directory.refresh().await.inspect_err(|error| {
            tracing::warn!(error = %error, "thread refresh failed, keeping previous list");
        })
    }

    pub async fn refresh_contacts(&self) -> FetchResult<Arc<Vec<Partner>>> {
        let contacts = self.partners.refresh_contacts().await.inspect_err(|error| {
            tracing::warn!(error = %error, "contact refresh failed, keeping previous list");
        })?;
        self.events.emit(SessionEvent::ContactsRefreshed {
            contact_count: contacts.len(),
        });
        Ok(contacts)
    }

    /// Opens `thread`: follow its live feed, render from cache, then fetch the newest page.
    pub async fn open_thread(&self, thread: Thread) -> FetchResult<()> {
        let key = thread.key;
        self.open.store(Arc::new(Some(thread.clone())));
        self.events.emit(SessionEvent::ThreadOpened { thread: key });
        self.follow_live(&key);

        let Some(thread_id) = key.persisted_id() else {
            return Ok(());
        };

        let page_size = self.settings.message_page_size;
        let records = self
            .backend
            .list_messages(thread_id, MessagePage::latest(page_size))
            .await
            .context(ListingSnafu {
                stage: "open-thread-fetch",
                listing: "messages",
            })
            .inspect_err(|error| {
                tracing::warn!(thread = %thread_id, error = %error, "message fetch failed, keeping cached messages");
            })?;

        let has_more = records.len() >= page_size as usize;
        let unread = records
            .iter()
            .filter(|record| record.sender_id != self.viewer && !record.is_read)
            .map(|record| record.id)
            .collect::<Vec<_>>();
        let messages = self.messages_from_records(records, &thread);

        // Written under the fetched thread's own key even if the user has moved on.
        self.cache.replace_authoritative(key, messages);
        self.set_has_more(thread_id, has_more);
        self.events.emit(SessionEvent::MessagesChanged { thread: key });

        if self.open_thread_key() != Some(key) {
            tracing::debug!(thread = %thread_id, "thread left before its fetch returned, not marking read");
            return Ok(());
        }
        if !unread.is_empty() {
            let count = unread.len();
            match self.backend.mark_read(unread).await {
                Ok(()) => tracing::debug!(thread = %thread_id, count, "marked partner messages read"),
                Err(error) => {
                    tracing::warn!(thread = %thread_id, error = %error, "mark read failed");
                }
            }
        }
        self.directory.mark_thread_read(thread_id);
        Ok(())
    }

    /// Prepends the page before the oldest cached message. Returns how many were added.
    pub async fn load_older(&self) -> FetchResult<usize> {
        let Some(thread) = self.current_thread() else {
            return Ok(0);
        };
        let Some(thread_id) = thread.persisted_id() else {
            return Ok(0);
        };
        if !self.has_more_for(thread_id) {
            return Ok(0);
        }
        let Some(_loading) = self.loading_older.try_begin(thread_id) else {
            tracing::debug!(thread = %thread_id, "older page already loading");
            return Ok(0);
        };

        let oldest = self.cache.get(&thread.key).iter().find_map(|message| {
            message.key.persisted_id().map(|message_id| MessageCursor {
                created_at_unix_ms: message.created_at_unix_ms,
                message_id,
            })
        });
        let Some(oldest) = oldest else {
            return Ok(0);
        };

        let page_size = self.settings.message_page_size;
        let records = self
            .backend
            .list_messages(thread_id, MessagePage::before(page_size, oldest))
            .await
            .context(ListingSnafu {
                stage: "load-older-fetch",
                listing: "messages",
            })
            .inspect_err(|error| {
                tracing::warn!(thread = %thread_id, error = %error, "older page fetch failed");
            })?;

        self.set_has_more(thread_id, records.len() >= page_size as usize);
        let older = self.messages_from_records(records, &thread);
        let inserted = self.cache.prepend_older(thread.key, older);
        if inserted > 0 {
            self.events
                .emit(SessionEvent::MessagesChanged { thread: thread.key });
        }
        tracing::debug!(thread = %thread_id, inserted, "older page loaded");
        Ok(inserted)
    }

    /// Opens the existing conversation with `user_id`, or a draft when there is none.
    pub async fn start_conversation(&self, user_id: UserId) -> FetchResult<Thread> {
        ensure!(
            user_id != self.viewer,
            SelfConversationSnafu {
                stage: "start-conversation-validate",
                user_id,
            }
        );

        let thread = match self.directory.find_by_partner(user_id) {
            Some(existing) => existing,
            None => {
                let partner = match self.partners.find_contact(user_id) {
                    Some(partner) => partner,
                    None => self.partners.resolve(user_id).await,
                };
                Thread::draft(self.viewer, partner)
            }
        };

        // A failed fetch still leaves the thread open with whatever was cached.
        let _ = self.open_thread(thread.clone()).await;
        Ok(thread)
    }

    /// Deep-link entry point: reload listings, then jump to the conversation.
    pub async fn open_chat_with_user(&self, user_id: UserId) -> FetchResult<Thread> {
        let _ = futures::join!(self.refresh_contacts(), self.refresh_threads());
        self.start_conversation(user_id).await
    }

    pub fn close_thread(&self) {
        self.open.store(Arc::new(None));
        self.live.unfollow();
        self.events.emit(SessionEvent::ThreadClosed);
    }

    /// Sends the composer's current text to the open thread.
    pub async fn submit(&self) -> SendResult<SendOutcome> {
        let text = self.composer.text();
        self.send(&text).await
    }

    pub async fn send(&self, text: &str) -> SendResult<SendOutcome> {
        let thread = self.current_thread().ok_or_else(|| {
                NoOpenThreadSnafu {
                    stage: "send-open-thread",
                }
                .build()
            })?;

        let pending = self.sends.begin(&thread, text)?;
        self.events.emit(SessionEvent::MessagesChanged {
            thread: pending.thread(),
        });

        match self.sends.complete(pending).await {
            Ok(outcome) => {
                if let Some(thread_id) = outcome.promoted {
                    self.promote_open_thread(thread.key, thread_id);
                }
                self.events.emit(SessionEvent::MessagesChanged {
                    thread: outcome.thread,
                });
                let _ = self.refresh_threads().await;
                Ok(outcome)
            }
            Err(failed) => {
                self.events.emit(SessionEvent::MessagesChanged {
                    thread: failed.thread,
                });
                self.events.emit(SessionEvent::SendFailed(SendNotice {
                    thread: failed.thread,
                    reason: failed.error.to_string(),
                    restored_text: failed.restored_text,
                }));
                Err(failed.error)
            }
        }
    }

    /// Stops polling and the live feed and forgets every cached message.
    pub fn shutdown(&self) {
        self.lock_polling().take();
        self.live.unfollow();
        self.open.store(Arc::new(None));
        self.cache.clear();
        tracing::debug!(viewer = %self.viewer, "chat session shut down");
    }

    fn promote_open_thread(&self, draft: ThreadKey, thread_id: ThreadId) {
        let mut promoted = None;
        self.open.rcu(|current| match &**current {
            Some(open) if open.key == draft => {
                let mut open = open.clone();
                open.promote(thread_id);
                promoted = Some(open.key);
                Some(open)
            }
            other => {
                promoted = None;
                other.clone()
            }
        });

        self.events.emit(SessionEvent::ThreadPromoted {
            from: draft,
            to: thread_id,
        });
        // Only the thread still on screen gets a live feed.
        if let Some(key) = promoted {
            self.follow_live(&key);
        }
    }

    fn follow_live(&self, key: &ThreadKey) {
        if let Err(error) = self.live.follow(key) {
            tracing::warn!(thread = %key, error = %error, "live updates unavailable");
            if let Some(thread_id) = key.persisted_id() {
                self.events.emit(SessionEvent::SubscriptionFailed {
                    thread: thread_id,
                    reason: error.to_string(),
                });
            }
        }
    }

    fn messages_from_records(&self, records: Vec<MessageRecord>, thread: &Thread) -> Vec<Message> {
        let me = self.partners.cached(self.viewer);
        records
            .into_iter()
            .map(|record| {
                let sender = if record.sender_id == thread.partner_id() {
                    Some(thread.partner.clone())
                } else if record.sender_id == self.viewer {
                    me.clone()
                } else {
                    self.partners.cached(record.sender_id)
                };
                Message::from_record(record, sender)
            })
            .collect()
    }

    fn has_more_for(&self, thread_id: ThreadId) -> bool {
        self.has_more.load().get(&thread_id).copied().unwrap_or(false)
    }

    fn set_has_more(&self, thread_id: ThreadId, has_more: bool) {
        self.has_more.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(thread_id, has_more);
            next
        });
    }

    fn lock_polling(&self) -> MutexGuard<'_, Option<PollingHandle>> {
        self.polling.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.live.unfollow();
    }
}
