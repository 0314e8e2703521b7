use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use farmchat_storage::{Backend, NewMessage, ThreadId, UserId};
use snafu::ensure;

use super::cache::{MessageCache, ReplaceOutcome};
use super::message::{Message, MessageKey, ProvisionalToken, Thread, ThreadKey, TokenAllocator};
use super::partners::PartnerDirectory;
use crate::error::{AlreadySendingSnafu, EmptyContentSnafu, SendError, SendResult};

/// The message input field.
#[derive(Debug, Default)]
pub struct Composer {
    text: ArcSwap<String>,
}

impl Composer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> String {
        self.text.load().as_ref().clone()
    }

    pub fn set_text(&self, text: impl Into<String>) {
        self.text.store(Arc::new(text.into()));
    }

    pub fn clear(&self) {
        self.set_text(String::new());
    }

    pub fn is_empty(&self) -> bool {
        self.text.load().is_empty()
    }
}

/// Keys with an operation in flight. Membership is held by an [`InFlightGuard`].
pub struct InFlight<K> {
    keys: Arc<ArcSwap<HashSet<K>>>,
}

impl<K> Default for InFlight<K> {
    fn default() -> Self {
        Self {
            keys: Arc::new(ArcSwap::from_pointee(HashSet::new())),
        }
    }
}

impl<K> InFlight<K>
where
    K: Clone + Eq + Hash,
{
    /// Claims `key`, or returns `None` when it is already claimed.
    pub fn try_begin(&self, key: K) -> Option<InFlightGuard<K>> {
        let mut claimed = false;
        self.keys.rcu(|current| {
            let mut next = HashSet::clone(current);
            claimed = next.insert(key.clone());
            next
        });
        claimed.then(|| InFlightGuard {
            keys: self.keys.clone(),
            key,
        })
    }

    pub fn contains(&self, key: &K) -> bool {
        self.keys.load().contains(key)
    }
}

pub struct InFlightGuard<K>
where
    K: Clone + Eq + Hash,
{
    keys: Arc<ArcSwap<HashSet<K>>>,
    key: K,
}

impl<K> Drop for InFlightGuard<K>
where
    K: Clone + Eq + Hash,
{
    fn drop(&mut self) {
        self.keys.rcu(|current| {
            let mut next = HashSet::clone(current);
            next.remove(&self.key);
            next
        });
    }
}

/// An optimistic message that is in the cache and waiting on the server.
pub struct PendingSend {
    thread: ThreadKey,
    receiver: UserId,
    token: ProvisionalToken,
    content: String,
    original_text: String,
    _claim: InFlightGuard<ThreadKey>,
}

impl PendingSend {
    pub fn thread(&self) -> ThreadKey {
        self.thread
    }

    pub fn key(&self) -> MessageKey {
        MessageKey::Provisional(self.token)
    }
}

/// Result of a reconciled send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub thread: ThreadKey,
    pub message: Message,
    /// Set when a drafted thread received its server id.
    pub promoted: Option<ThreadId>,
    pub replace: ReplaceOutcome,
}

/// A send that was rolled back, with the text put back into the composer.
#[derive(Debug)]
pub struct FailedSend {
    pub thread: ThreadKey,
    pub restored_text: String,
    pub error: SendError,
}

/// Optimistic insert, persist, then reconcile or roll back.
pub struct SendPipeline {
    backend: Arc<dyn Backend>,
    viewer: UserId,
    cache: Arc<MessageCache>,
    composer: Arc<Composer>,
    partners: Arc<PartnerDirectory>,
    tokens: TokenAllocator,
    in_flight: InFlight<ThreadKey>,
    timeout: Duration,
}

impl SendPipeline {
    pub fn new(
        backend: Arc<dyn Backend>,
        viewer: UserId,
        cache: Arc<MessageCache>,
        composer: Arc<Composer>,
        partners: Arc<PartnerDirectory>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            viewer,
            cache,
            composer,
            partners,
            tokens: TokenAllocator::default(),
            in_flight: InFlight::default(),
            timeout,
        }
    }

    pub fn is_sending(&self, thread: &ThreadKey) -> bool {
        self.in_flight.contains(thread)
    }

    /// Validates, clears the composer and caches the provisional message. Never suspends.
    pub fn begin(&self, thread: &Thread, text: &str) -> SendResult<PendingSend> {
        let content = text.trim();
        ensure!(
            !content.is_empty(),
            EmptyContentSnafu {
                stage: "send-validate-content",
            }
        );

        let claim = self
            .in_flight
            .try_begin(thread.key)
            .ok_or_else(|| {
                AlreadySendingSnafu {
                    stage: "send-claim-thread",
                    thread: thread.key,
                }
                .build()
            })?;

        self.composer.clear();

        let token = self.tokens.next();
        let message = Message::provisional(
            token,
            thread.key,
            self.viewer,
            content,
            self.partners.cached(self.viewer),
        );
        self.cache.append(thread.key, message);
        tracing::debug!(thread = %thread.key, message = %token, "optimistic message cached");

        Ok(PendingSend {
            thread: thread.key,
            receiver: thread.partner_id(),
            token,
            content: content.to_string(),
            original_text: text.to_string(),
            _claim: claim,
        })
    }

    /// Persists a pending send within the timeout, then reconciles the cache.
    pub async fn complete(&self, pending: PendingSend) -> Result<SendOutcome, FailedSend> {
        let request = self.backend.send_message(
            self.viewer,
            NewMessage {
                receiver_id: pending.receiver,
                content: pending.content.clone(),
            },
        );

        let result = match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(receipt)) => Ok(receipt),
            Ok(Err(error)) => Err(SendError::from_storage("send-persist", error)),
            Err(_elapsed) => Err(SendError::TimedOut {
                stage: "send-persist-timeout",
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(receipt) => Ok(self.reconcile_success(&pending, receipt)),
            Err(error) => Err(self.reconcile_failure(pending, error)),
        }
    }

    fn reconcile_success(
        &self,
        pending: &PendingSend,
        receipt: farmchat_storage::SendReceipt,
    ) -> SendOutcome {
        let authoritative_thread = ThreadKey::Persisted(receipt.thread_id);
        let mut message =
            Message::from_record(receipt.message, self.partners.cached(self.viewer));
        // Stays under the holding key until the rekey below moves the whole entry.
        message.thread = pending.thread;

        let replace = self.cache.replace(pending.thread, &pending.key(), message.clone());

        let promoted = if pending.thread.is_new() {
            self.cache.rekey(pending.thread, authoritative_thread);
            tracing::info!(
                from = %pending.thread,
                to = %receipt.thread_id,
                "draft thread promoted"
            );
            Some(receipt.thread_id)
        } else {
            None
        };

        message.thread = authoritative_thread;
        tracing::info!(
            thread = %authoritative_thread,
            provisional = %pending.token,
            message = %message.key,
            ?replace,
            "message sent"
        );

        SendOutcome {
            thread: authoritative_thread,
            message,
            promoted,
            replace,
        }
    }

    fn reconcile_failure(&self, pending: PendingSend, error: SendError) -> FailedSend {
        self.cache.remove(pending.thread, &pending.key());
        self.composer.set_text(pending.original_text.clone());
        tracing::warn!(
            thread = %pending.thread,
            provisional = %pending.token,
            error = %error,
            "send failed, optimistic message rolled back"
        );

        FailedSend {
            thread: pending.thread,
            restored_text: pending.original_text,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_claims_are_exclusive_until_released() {
        let in_flight = InFlight::default();
        let key = ThreadKey::New {
            partner: UserId::new_v7(),
        };

        let guard = in_flight.try_begin(key).expect("first claim");
        assert!(in_flight.try_begin(key).is_none());
        assert!(in_flight.contains(&key));

        drop(guard);
        assert!(!in_flight.contains(&key));
        assert!(in_flight.try_begin(key).is_some());
    }

    #[test]
    fn composer_round_trips_text() {
        let composer = Composer::new();
        composer.set_text("fresh eggs");
        assert_eq!(composer.text(), "fresh eggs");

        composer.clear();
        assert!(composer.is_empty());
    }
}
