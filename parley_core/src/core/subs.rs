//! Subscription table
//!
//! Ordered list of (fulltopic, callback) entries. The fulltopic is unique
//! within the table: re-subscribing under the same fulltopic swaps the
//! callback in place, keeping the entry's position. Dispatch order is
//! insertion order.

use std::sync::Arc;

use super::node::Node;
use crate::transport::Message;

/// Subscription callback
///
/// Receives the node, the user-level topic, and the message with its
/// routing field already detached. A `Some` return from a replier
/// subscription is sent back to the requester; subscriber returns are
/// discarded.
pub type SubscriptionFn = dyn Fn(&Node, &str, &Message) -> Option<Message> + Send + Sync;

pub(crate) struct Subscription {
    pub fulltopic: String,
    pub callback: Arc<SubscriptionFn>,
}

#[derive(Default)]
pub(crate) struct SubscriptionTable {
    entries: Vec<Subscription>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a subscription, or update the callback of an existing entry
    /// with the same fulltopic in place
    pub fn upsert(&mut self, fulltopic: String, callback: Arc<SubscriptionFn>) {
        match self.entries.iter().position(|s| s.fulltopic == fulltopic) {
            Some(idx) => self.entries[idx].callback = callback,
            None => self.entries.push(Subscription {
                fulltopic,
                callback,
            }),
        }
    }

    /// Remove the entry whose stored fulltopic equals `topic` exactly
    pub fn remove(&mut self, topic: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|s| s.fulltopic != topic);
        self.entries.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
