use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use farmchat_storage::{Backend, FeedCancel, FeedEvent, FeedEvents, MessageRecord, ThreadId, UserId};
use snafu::ResultExt;
use tokio::task::JoinHandle;

use super::cache::MessageCache;
use super::directory::ThreadDirectory;
use super::events::{EventSink, SessionEvent};
use super::message::{Message, ThreadKey};
use super::partners::PartnerDirectory;
use crate::error::{SubscribeSnafu, SubscriptionError};

struct ActiveFeed {
    thread_id: ThreadId,
    cancel: FeedCancel,
    reader: JoinHandle<()>,
}

impl ActiveFeed {
    fn shutdown(mut self) {
        self.cancel.cancel();
        self.reader.abort();
    }
}

/// Keeps at most one push subscription, for the open persisted thread.
pub struct LiveSubscriber {
    backend: Arc<dyn Backend>,
    viewer: UserId,
    cache: Arc<MessageCache>,
    partners: Arc<PartnerDirectory>,
    directory: Arc<ThreadDirectory>,
    events: EventSink,
    active: Mutex<Option<ActiveFeed>>,
}

impl LiveSubscriber {
    pub fn new(
        backend: Arc<dyn Backend>,
        viewer: UserId,
        cache: Arc<MessageCache>,
        partners: Arc<PartnerDirectory>,
        directory: Arc<ThreadDirectory>,
        events: EventSink,
    ) -> Self {
        Self {
            backend,
            viewer,
            cache,
            partners,
            directory,
            events,
            active: Mutex::new(None),
        }
    }

    /// Points the subscription at `thread`. The old subscription is torn down first;
    /// drafts get none.
    pub fn follow(self: &Arc<Self>, thread: &ThreadKey) -> Result<(), SubscriptionError> {
        let mut active = self.lock_active();
        let Some(thread_id) = thread.persisted_id() else {
            Self::teardown(&mut active);
            return Ok(());
        };
        if active.as_ref().is_some_and(|feed| feed.thread_id == thread_id) {
            return Ok(());
        }
        Self::teardown(&mut active);

        let subscription = self.backend.subscribe(thread_id).context(SubscribeSnafu {
            stage: "live-subscribe",
            thread_id,
        })?;
        let (events, cancel) = subscription.into_parts();
        let reader = tokio::spawn(read_feed(Arc::downgrade(self), events));

        tracing::debug!(thread = %thread_id, "live subscription established");
        *active = Some(ActiveFeed {
            thread_id,
            cancel,
            reader,
        });
        Ok(())
    }

    pub fn unfollow(&self) {
        Self::teardown(&mut self.lock_active());
    }

    pub fn subscribed_thread(&self) -> Option<ThreadId> {
        self.lock_active().as_ref().map(|feed| feed.thread_id)
    }

    fn teardown(active: &mut Option<ActiveFeed>) {
        if let Some(feed) = active.take() {
            tracing::debug!(thread = %feed.thread_id, "live subscription torn down");
            feed.shutdown();
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveFeed>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn handle_event(&self, event: FeedEvent) {
        let thread_id = event.thread_id();
        if self.subscribed_thread() != Some(thread_id) {
            tracing::debug!(thread = %thread_id, "ignoring event for another thread");
            return;
        }

        match event {
            FeedEvent::MessageInserted(record) => self.merge_inserted(record).await,
            FeedEvent::MessageUpdated(record) => {
                let thread = ThreadKey::Persisted(record.thread_id);
                if self.cache.apply_read_state(
                    thread,
                    record.id,
                    record.is_read,
                    record.read_at_unix_ms,
                ) {
                    self.events.emit(SessionEvent::MessagesChanged { thread });
                }
            }
        }

        if let Err(error) = self.directory.refresh().await {
            tracing::warn!(error = %error, "thread refresh after live event failed");
        }
    }

    async fn merge_inserted(&self, record: MessageRecord) {
        let thread = ThreadKey::Persisted(record.thread_id);
        let sender = self.partners.resolve(record.sender_id).await;
        let from_partner = record.sender_id != self.viewer;
        let needs_read = from_partner && !record.is_read;
        let message_id = record.id;

        if self
            .cache
            .append(thread, Message::from_record(record, Some(sender)))
        {
            tracing::debug!(thread = %thread, message = %message_id, "live message merged");
            self.events.emit(SessionEvent::MessagesChanged { thread });
        }

        // The thread is on screen, so the partner's message counts as seen.
        if needs_read && let Err(error) = self.backend.mark_read(vec![message_id]).await {
            tracing::warn!(message = %message_id, error = %error, "marking live message read failed");
        }
    }
}

impl Drop for LiveSubscriber {
    fn drop(&mut self) {
        let active = self
            .active
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        Self::teardown(active);
    }
}

async fn read_feed(subscriber: Weak<LiveSubscriber>, mut events: FeedEvents) {
    let thread_id = events.thread_id();
    while let Some(event) = events.recv().await {
        let Some(subscriber) = subscriber.upgrade() else {
            break;
        };
        subscriber.handle_event(event).await;
    }
    tracing::debug!(thread = %thread_id, "live feed reader finished");
}
