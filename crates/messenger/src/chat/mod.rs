/// Per-thread message lists and their reconciliation primitives.
pub mod cache;
pub mod directory;
/// Events the session reports to the presentation layer.
pub mod events;
pub mod live;
/// Keys, messages and threads as the widget sees them.
pub mod message;
pub mod partners;
pub mod send;
pub mod session;
pub mod unread;

pub use cache::{MessageCache, ReplaceOutcome};
pub use directory::{PollingHandle, ThreadDirectory};
pub use events::{EventSink, SendNotice, SessionEvent, SessionEvents, event_channel};
pub use live::LiveSubscriber;
pub use message::{Message, MessageKey, ProvisionalToken, Thread, ThreadKey, TokenAllocator};
pub use partners::{Partner, PartnerDirectory, display_name};
pub use send::{Composer, FailedSend, InFlight, InFlightGuard, PendingSend, SendOutcome, SendPipeline};
pub use session::{ChatSession, ThreadView};
pub use unread::{BadgeFilter, UnreadSummary, badge_label};
