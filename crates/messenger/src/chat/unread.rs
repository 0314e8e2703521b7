use std::collections::{HashMap, HashSet};

use farmchat_storage::{ThreadId, ThreadKind};

use super::message::Thread;

pub const BADGE_CAP: u32 = 99;

/// Thread kinds left out of the total badge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BadgeFilter {
    excluded: HashSet<ThreadKind>,
}

impl BadgeFilter {
    pub fn new(excluded: impl IntoIterator<Item = ThreadKind>) -> Self {
        Self {
            excluded: excluded.into_iter().collect(),
        }
    }

    pub fn counts(&self, kind: ThreadKind) -> bool {
        !self.excluded.contains(&kind)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnreadSummary {
    pub total: u32,
    pub per_thread: HashMap<ThreadId, u32>,
}

impl UnreadSummary {
    pub fn compute(threads: &[Thread], filter: &BadgeFilter) -> Self {
        let mut summary = Self::default();
        for thread in threads {
            let Some(thread_id) = thread.persisted_id() else {
                continue;
            };
            summary.per_thread.insert(thread_id, thread.unread_count);
            if filter.counts(thread.kind) {
                summary.total = summary.total.saturating_add(thread.unread_count);
            }
        }
        summary
    }

    pub fn for_thread(&self, thread_id: ThreadId) -> u32 {
        self.per_thread.get(&thread_id).copied().unwrap_or(0)
    }

    pub fn total_label(&self) -> Option<String> {
        badge_label(self.total)
    }
}

/// `None` hides the badge; counts above the cap render as `99+`.
pub fn badge_label(count: u32) -> Option<String> {
    match count {
        0 => None,
        1..=BADGE_CAP => Some(count.to_string()),
        _ => Some(format!("{BADGE_CAP}+")),
    }
}

#[cfg(test)]
mod tests {
    use farmchat_storage::UserId;

    use super::*;
    use crate::chat::message::ThreadKey;
    use crate::chat::partners::Partner;

    fn thread(kind: ThreadKind, unread_count: u32) -> Thread {
        let viewer = UserId::new_v7();
        let mut thread = Thread::draft(viewer, Partner::unknown(UserId::new_v7()));
        thread.key = ThreadKey::Persisted(ThreadId::new_v7());
        thread.kind = kind;
        thread.unread_count = unread_count;
        thread
    }

    #[test]
    fn total_skips_excluded_kinds_but_rows_keep_their_counts() {
        let direct = thread(ThreadKind::UserToUser, 3);
        let notice = thread(ThreadKind::System, 40);
        let support = thread(ThreadKind::AdminToUser, 2);
        let threads = vec![direct.clone(), notice.clone(), support];

        let everything = UnreadSummary::compute(&threads, &BadgeFilter::default());
        assert_eq!(everything.total, 45);

        let filtered = UnreadSummary::compute(&threads, &BadgeFilter::new([ThreadKind::System]));
        assert_eq!(filtered.total, 5);
        let notice_id = notice.persisted_id().expect("persisted");
        assert_eq!(filtered.for_thread(notice_id), 40);
    }

    #[test]
    fn drafts_are_not_counted() {
        let draft = Thread::draft(UserId::new_v7(), Partner::unknown(UserId::new_v7()));
        let summary = UnreadSummary::compute(&[draft], &BadgeFilter::default());
        assert_eq!(summary, UnreadSummary::default());
    }

    #[test]
    fn badge_label_caps_at_ninety_nine() {
        assert_eq!(badge_label(0), None);
        assert_eq!(badge_label(7).as_deref(), Some("7"));
        assert_eq!(badge_label(99).as_deref(), Some("99"));
        assert_eq!(badge_label(100).as_deref(), Some("99+"));
    }
}
