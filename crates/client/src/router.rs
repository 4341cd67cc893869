//! Subscription registry multiplexing one connection to many listeners.
//!
//! Every call to subscribe creates an independent entry, even for a topic
//! that already has one. Callers must unsubscribe a stale handle before
//! subscribing to the same topic again, or they will see each frame twice.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde_json::Value;

const ID_PREFIX: &str = "sub-";

/// A frame delivered to a subscription handler.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub topic: String,
    pub body: Value,
}

pub type Handler = Arc<dyn Fn(&InboundFrame) + Send + Sync>;

struct Entry {
    topic: String,
    handler: Handler,
}

/// Maps subscription ids to topics and handlers.
///
/// Ids are never reused for the lifetime of the router, so a stale handle can
/// not revoke a newer subscription.
#[derive(Default)]
pub struct SubscriptionRouter {
    next_id: u64,
    entries: BTreeMap<u64, Entry>,
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler and return its wire id.
    pub fn register(&mut self, topic: &str, handler: Handler) -> String {
        self.next_id += 1;
        self.entries.insert(
            self.next_id,
            Entry {
                topic: topic.to_string(),
                handler,
            },
        );
        format!("{}{}", ID_PREFIX, self.next_id)
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn remove(&mut self, id: &str) -> bool {
        parse_id(id)
            .and_then(|n| self.entries.remove(&n))
            .is_some()
    }

    /// Look up the handler for the `subscription` header of a MESSAGE frame.
    pub fn route(&self, id: &str) -> Option<(String, Handler)> {
        let entry = self.entries.get(&parse_id(id)?)?;
        Some((entry.topic.clone(), Arc::clone(&entry.handler)))
    }

    /// All live subscriptions as `(id, topic)`, oldest first.
    pub fn active(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|(n, e)| (format!("{}{}", ID_PREFIX, n), e.topic.clone()))
            .collect()
    }

    /// Drop every subscription, returning the ids that were live.
    pub fn clear(&mut self) -> Vec<String> {
        let ids = self
            .entries
            .keys()
            .map(|n| format!("{}{}", ID_PREFIX, n))
            .collect();
        self.entries.clear();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_id(id: &str) -> Option<u64> {
    id.strip_prefix(ID_PREFIX)?.parse().ok()
}

/// Something that can cancel a subscription by id.
pub(crate) trait Revoke: Send + Sync {
    fn revoke(&self, id: &str);
}

/// Caller-owned token for one subscription.
///
/// The subscription stays active until [`SubscriptionHandle::unsubscribe`] is
/// called or the connection is torn down. Dropping the handle does not
/// unsubscribe.
#[must_use = "an unused handle can never be unsubscribed"]
pub struct SubscriptionHandle {
    id: String,
    topic: String,
    revoker: Weak<dyn Revoke>,
    revoked: AtomicBool,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: String, topic: String, revoker: Weak<dyn Revoke>) -> Self {
        Self {
            id,
            topic,
            revoker,
            revoked: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Stop delivery. Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        if self.revoked.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(revoker) = self.revoker.upgrade() {
            revoker.revoke(&self.id);
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("revoked", &self.is_revoked())
            .finish()
    }
}
