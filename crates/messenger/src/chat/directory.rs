use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use farmchat_storage::{Backend, ThreadId, ThreadKind, UserId};
use snafu::ResultExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::events::{EventSink, SessionEvent};
use super::message::{Thread, ThreadKey};
use super::partners::PartnerDirectory;
use super::unread::{BadgeFilter, UnreadSummary};
use crate::error::{FetchResult, ListingSnafu};

/// The viewer's conversations, in the order the listing endpoint returned them.
pub struct ThreadDirectory {
    backend: Arc<dyn Backend>,
    viewer: UserId,
    partners: Arc<PartnerDirectory>,
    events: EventSink,
    badge_filter: BadgeFilter,
    threads: ArcSwap<Vec<Thread>>,
    unread: ArcSwap<UnreadSummary>,
}

impl ThreadDirectory {
    pub fn new(
        backend: Arc<dyn Backend>,
        viewer: UserId,
        partners: Arc<PartnerDirectory>,
        events: EventSink,
        badge_filter: BadgeFilter,
    ) -> Self {
        Self {
            backend,
            viewer,
            partners,
            events,
            badge_filter,
            threads: ArcSwap::from_pointee(Vec::new()),
            unread: ArcSwap::from_pointee(UnreadSummary::default()),
        }
    }

    /// Replaces the list with a fresh listing. On failure the previous list stays.
    pub async fn refresh(&self) -> FetchResult<Arc<Vec<Thread>>> {
        let summaries = self
            .backend
            .list_threads(self.viewer)
            .await
            .context(ListingSnafu {
                stage: "threads-refresh",
                listing: "threads",
            })?;

        let threads = summaries
            .into_iter()
            .map(|summary| Thread::from_summary(summary, self.viewer))
            .collect::<Vec<_>>();
        for thread in &threads {
            self.partners.remember(thread.partner.clone());
        }

        let threads = Arc::new(threads);
        self.threads.store(threads.clone());
        let summary = self.recompute_unread();

        tracing::debug!(
            count = threads.len(),
            total_unread = summary.total,
            "thread list refreshed"
        );
        self.events.emit(SessionEvent::ThreadsRefreshed {
            thread_count: threads.len(),
            total_unread: summary.total,
        });
        Ok(threads)
    }

    pub fn threads(&self) -> Arc<Vec<Thread>> {
        self.threads.load_full()
    }

    pub fn unread(&self) -> Arc<UnreadSummary> {
        self.unread.load_full()
    }

    pub fn find(&self, thread_id: ThreadId) -> Option<Thread> {
        let key = ThreadKey::Persisted(thread_id);
        self.threads
            .load()
            .iter()
            .find(|thread| thread.key == key)
            .cloned()
    }

    /// The direct conversation with `partner`, if one exists.
    pub fn find_by_partner(&self, partner: UserId) -> Option<Thread> {
        self.threads
            .load()
            .iter()
            .find(|thread| thread.kind == ThreadKind::UserToUser && thread.partner_id() == partner)
            .cloned()
    }

    /// Zeroes the local unread count of one thread. Returns false if nothing changed.
    pub fn mark_thread_read(&self, thread_id: ThreadId) -> bool {
        let key = ThreadKey::Persisted(thread_id);
        let mut changed = false;
        self.threads.rcu(|current| {
            changed = false;
            let mut next = Vec::clone(current);
            if let Some(thread) = next.iter_mut().find(|thread| thread.key == key)
                && thread.unread_count > 0
            {
                thread.unread_count = 0;
                changed = true;
            }
            next
        });
        if changed {
            self.recompute_unread();
        }
        changed
    }

    fn recompute_unread(&self) -> Arc<UnreadSummary> {
        let summary = Arc::new(UnreadSummary::compute(
            &self.threads.load(),
            &self.badge_filter,
        ));
        self.unread.store(summary.clone());
        summary
    }

    /// Refreshes every `period` until the handle is dropped or the directory goes away.
    pub fn spawn_polling(self: &Arc<Self>, period: Duration) -> PollingHandle {
        let directory = Arc::downgrade(self);
        let task = tokio::spawn(poll_threads(directory, period));
        tracing::debug!(period_ms = period.as_millis() as u64, "thread polling started");
        PollingHandle { task }
    }
}

async fn poll_threads(directory: Weak<ThreadDirectory>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(directory) = directory.upgrade() else {
            break;
        };
        // Failures wait for the next tick.
        if let Err(error) = directory.refresh().await {
            tracing::warn!(error = %error, "thread polling refresh failed");
        }
    }
}

pub struct PollingHandle {
    task: JoinHandle<()>,
}

impl PollingHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for PollingHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
