use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

use super::ids::ThreadId;
use super::types::MessageRecord;

/// Row-level change pushed by the transport for one thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    MessageInserted(MessageRecord),
    MessageUpdated(MessageRecord),
}

impl FeedEvent {
    pub fn thread_id(&self) -> ThreadId {
        self.message().thread_id
    }

    pub fn message(&self) -> &MessageRecord {
        match self {
            Self::MessageInserted(message) | Self::MessageUpdated(message) => message,
        }
    }
}

/// Receiving half of a subscription.
pub struct FeedEvents {
    thread_id: ThreadId,
    events: mpsc::UnboundedReceiver<FeedEvent>,
}

impl FeedEvents {
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub async fn recv(&mut self) -> Option<FeedEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<FeedEvent> {
        self.events.try_recv().ok()
    }
}

/// Teardown half of a subscription. Dropping it unsubscribes.
pub struct FeedCancel {
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl FeedCancel {
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for FeedCancel {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// One live subscription to a thread's message feed.
pub struct FeedSubscription {
    events: FeedEvents,
    cancel: FeedCancel,
}

impl FeedSubscription {
    pub fn new(
        thread_id: ThreadId,
        events: mpsc::UnboundedReceiver<FeedEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            events: FeedEvents { thread_id, events },
            cancel: FeedCancel {
                cancel_tx: Some(cancel_tx),
            },
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.events.thread_id
    }

    pub async fn recv(&mut self) -> Option<FeedEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<FeedEvent> {
        self.events.try_recv()
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel.cancel()
    }

    /// Splits the subscription so the reader and the owner can live in different places.
    pub fn into_parts(self) -> (FeedEvents, FeedCancel) {
        (self.events, self.cancel)
    }
}

/// Transport-side half of a subscription.
pub struct FeedSender {
    thread_id: ThreadId,
    events_tx: mpsc::UnboundedSender<FeedEvent>,
    cancel_rx: oneshot::Receiver<()>,
}

impl FeedSender {
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// False once the subscriber cancelled, dropped its cancel handle, or dropped its receiver.
    pub fn is_active(&mut self) -> bool {
        match self.cancel_rx.try_recv() {
            Err(TryRecvError::Empty) => !self.events_tx.is_closed(),
            Ok(()) | Err(TryRecvError::Closed) => false,
        }
    }

    pub fn send(&mut self, event: FeedEvent) -> bool {
        self.is_active() && self.events_tx.send(event).is_ok()
    }
}

pub fn feed_channel(thread_id: ThreadId) -> (FeedSender, FeedSubscription) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        FeedSender {
            thread_id,
            events_tx,
            cancel_rx,
        },
        FeedSubscription::new(thread_id, events_rx, cancel_tx),
    )
}

/// Fans row changes out to the subscribers of each thread.
#[derive(Default)]
pub struct FeedHub {
    subscribers: Mutex<Vec<FeedSender>>,
}

impl FeedHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, thread_id: ThreadId) -> FeedSubscription {
        let (sender, subscription) = feed_channel(thread_id);
        self.lock_subscribers().push(sender);
        tracing::debug!(thread = %thread_id, "feed subscription opened");
        subscription
    }

    /// Delivers `event` to every live subscriber of its thread and returns how many received it.
    pub fn publish(&self, event: FeedEvent) -> usize {
        let thread_id = event.thread_id();
        let mut subscribers = self.lock_subscribers();
        subscribers.retain_mut(FeedSender::is_active);

        let mut delivered = 0;
        for subscriber in subscribers
            .iter_mut()
            .filter(|subscriber| subscriber.thread_id == thread_id)
        {
            if subscriber.send(event.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Thread ids with a live subscription, one entry per subscription.
    pub fn active_subscriptions(&self) -> Vec<ThreadId> {
        let mut subscribers = self.lock_subscribers();
        subscribers.retain_mut(FeedSender::is_active);
        subscribers
            .iter()
            .map(|subscriber| subscriber.thread_id)
            .collect()
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Vec<FeedSender>> {
        // Senders hold no invariants a panicking holder could break.
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{MessageId, UserId};

    fn record(thread_id: ThreadId, content: &str) -> MessageRecord {
        MessageRecord {
            id: MessageId::new_v7(),
            thread_id,
            sender_id: UserId::new_v7(),
            content: content.to_string(),
            is_read: false,
            read_at_unix_ms: None,
            created_at_unix_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn publish_reaches_only_subscribers_of_the_event_thread() {
        let hub = FeedHub::new();
        let watched = ThreadId::new_v7();
        let other = ThreadId::new_v7();
        let mut watched_sub = hub.subscribe(watched);
        let mut other_sub = hub.subscribe(other);

        let delivered = hub.publish(FeedEvent::MessageInserted(record(watched, "hello")));

        assert_eq!(delivered, 1);
        let received = watched_sub.try_recv().expect("event for watched thread");
        assert_eq!(received.message().content, "hello");
        assert!(other_sub.try_recv().is_none());
    }

    #[test]
    fn cancelled_and_dropped_subscriptions_are_pruned() {
        let hub = FeedHub::new();
        let thread_id = ThreadId::new_v7();
        let mut cancelled = hub.subscribe(thread_id);
        let dropped = hub.subscribe(thread_id);
        let _kept = hub.subscribe(thread_id);
        assert_eq!(hub.active_subscriptions().len(), 3);

        assert!(cancelled.cancel());
        drop(dropped);

        assert_eq!(hub.active_subscriptions(), vec![thread_id]);
        assert_eq!(
            hub.publish(FeedEvent::MessageUpdated(record(thread_id, "read"))),
            1
        );
    }

    #[test]
    fn dropping_the_cancel_half_unsubscribes_even_if_reader_survives() {
        let hub = FeedHub::new();
        let thread_id = ThreadId::new_v7();
        let (_events, cancel) = hub.subscribe(thread_id).into_parts();

        drop(cancel);

        assert!(hub.active_subscriptions().is_empty());
    }
}
