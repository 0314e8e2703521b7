use farmchat_storage::ThreadId;
use tokio::sync::mpsc;

use super::message::ThreadKey;

/// Shown to the user as a blocking alert after a send was rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendNotice {
    pub thread: ThreadKey,
    pub reason: String,
    pub restored_text: String,
}

/// State changes the presentation layer re-renders on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ThreadsRefreshed { thread_count: usize, total_unread: u32 },
    ContactsRefreshed { contact_count: usize },
    ThreadOpened { thread: ThreadKey },
    ThreadClosed,
    /// The cached message list of `thread` changed.
    MessagesChanged { thread: ThreadKey },
    /// A drafted conversation got its server id on first send.
    ThreadPromoted { from: ThreadKey, to: ThreadId },
    SendFailed(SendNotice),
    /// Live updates are off for `thread`; polling still covers the thread list.
    SubscriptionFailed { thread: ThreadId, reason: String },
}

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Cloneable emitter shared by the session components.
#[derive(Debug, Clone)]
pub struct EventSink {
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn emit(&self, event: SessionEvent) {
        if self.events_tx.send(event).is_err() {
            tracing::trace!("session event dropped, receiver is gone");
        }
    }
}

pub fn event_channel() -> (EventSink, SessionEvents) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    (EventSink { events_tx }, events_rx)
}
