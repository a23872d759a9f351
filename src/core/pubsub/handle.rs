// src/core/pubsub/handle.rs

use super::SubscriptionRegistry;
use std::sync::Weak;

/// Cancels one listener registration. Dropping the handle without calling
/// [`unsubscribe`](Self::unsubscribe) leaves the listener registered until the
/// client disconnects.
#[derive(Debug)]
pub struct SubscriptionHandle {
    topic: String,
    listener_id: u64,
    registry: Weak<SubscriptionRegistry>,
}

impl SubscriptionHandle {
    pub(crate) fn new(topic: String, listener_id: u64, registry: Weak<SubscriptionRegistry>) -> Self {
        Self {
            topic,
            listener_id,
            registry,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn listener_id(&self) -> u64 {
        self.listener_id
    }

    /// Removes this handle's listener. Other listeners on the same topic keep
    /// receiving messages; the protocol subscription is cancelled only when the
    /// last one goes. Returns `false` if the listener was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.remove(&self.topic, self.listener_id),
            None => false,
        }
    }
}
