// src/core/pubsub/mod.rs

//! The topic subscription registry.
//! It maps topics to ordered listener sets, keeps the protocol-level
//! subscriptions in step with them, and fans inbound messages out.

use crate::core::RealtimeError;
use crate::core::connection::ActiveConnection;
use crate::core::protocol::StompFrame;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

pub mod handle;
pub mod message;

pub use handle::SubscriptionHandle;
pub use message::{InboundMessage, Payload};

/// A registered callback. Invoked on the connection's I/O task, so it should
/// return quickly.
pub type Listener = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// The protocol subscription currently backing a topic.
struct Binding {
    subscription_id: String,
    connection: Weak<ActiveConnection>,
}

impl Binding {
    /// The connection this binding was made on, if it is still usable.
    fn live_connection(&self) -> Option<Arc<ActiveConnection>> {
        self.connection.upgrade().filter(|c| c.is_open())
    }
}

#[derive(Default)]
struct TopicEntry {
    listeners: IndexMap<u64, Listener>,
    binding: Option<Binding>,
}

#[derive(Default)]
struct RegistryState {
    /// Topics in first-subscription order. Entries survive their last listener.
    topics: IndexMap<String, TopicEntry>,
    /// Subscription id to topic, for routing MESSAGE frames.
    by_subscription: HashMap<String, String>,
}

impl RegistryState {
    fn unbind(&mut self, topic: &str) -> Option<Binding> {
        let binding = self.topics.get_mut(topic)?.binding.take()?;
        self.by_subscription.remove(&binding.subscription_id);
        Some(binding)
    }

    fn bind(&mut self, topic: &str, subscription_id: String, connection: &Arc<ActiveConnection>) {
        self.by_subscription
            .insert(subscription_id.clone(), topic.to_string());
        if let Some(entry) = self.topics.get_mut(topic) {
            entry.binding = Some(Binding {
                subscription_id,
                connection: Arc::downgrade(connection),
            });
        }
    }
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
    next_listener_id: AtomicU64,
    next_subscription_id: AtomicU64,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SubscriptionRegistry")
            .field("topics", &state.topics.len())
            .field("bound", &state.by_subscription.len())
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    fn new_subscription_id(&self) -> String {
        let n = self.next_subscription_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("sub-{n}")
    }

    /// Adds `listener` to `topic`. The first listener on a topic (or the first
    /// one after the topic lost its protocol subscription) sends SUBSCRIBE over
    /// `connection` and waits for it to be written. If that fails the listener
    /// is removed again and the error is returned.
    pub async fn register(
        &self,
        topic: &str,
        listener: Listener,
        connection: &Arc<ActiveConnection>,
    ) -> Result<u64, RealtimeError> {
        let listener_id = self.next_listener_id.fetch_add(1, Ordering::Relaxed) + 1;
        let pending = {
            let mut state = self.state.lock();
            let bound = state
                .topics
                .get(topic)
                .and_then(|entry| entry.binding.as_ref())
                .and_then(Binding::live_connection)
                .is_some();

            let pending = if bound {
                None
            } else {
                let subscription_id = self.new_subscription_id();
                let pending = connection.subscribe(&subscription_id, topic)?;
                state.topics.entry(topic.to_string()).or_default();
                state.unbind(topic);
                state.bind(topic, subscription_id.clone(), connection);
                Some((subscription_id, pending))
            };
            if let Some(entry) = state.topics.get_mut(topic) {
                entry.listeners.insert(listener_id, listener);
            }
            pending
        };

        let Some((subscription_id, pending)) = pending else {
            return Ok(listener_id);
        };
        match pending.written().await {
            Ok(()) => {
                debug!(
                    "Subscribed to '{}' as {} on connection #{}.",
                    topic,
                    subscription_id,
                    connection.id()
                );
                Ok(listener_id)
            }
            Err(e) => {
                warn!("SUBSCRIBE {} to '{}' failed: {}", subscription_id, topic, e);
                self.remove(topic, listener_id);
                let mut state = self.state.lock();
                let stale = state
                    .topics
                    .get(topic)
                    .and_then(|entry| entry.binding.as_ref())
                    .is_some_and(|b| b.subscription_id == subscription_id);
                if stale {
                    state.unbind(topic);
                }
                Err(RealtimeError::SubscriptionFailed(format!(
                    "SUBSCRIBE to '{topic}' failed: {e}"
                )))
            }
        }
    }

    /// Removes one listener. When it was the topic's last, the protocol
    /// subscription is cancelled; the (empty) topic entry itself is kept.
    pub fn remove(&self, topic: &str, listener_id: u64) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.topics.get_mut(topic) else {
            return false;
        };
        if entry.listeners.shift_remove(&listener_id).is_none() {
            return false;
        }
        if !entry.listeners.is_empty() {
            return true;
        }

        if let Some(binding) = state.unbind(topic)
            && let Some(connection) = binding.live_connection()
        {
            match connection.unsubscribe(&binding.subscription_id) {
                Ok(()) => debug!(
                    "Unsubscribed {} from '{}'.",
                    binding.subscription_id, topic
                ),
                Err(e) => debug!(
                    "Could not send UNSUBSCRIBE for '{}': {}",
                    topic, e
                ),
            }
        }
        true
    }

    /// Re-issues SUBSCRIBE on a freshly established connection for every topic
    /// that still has listeners.
    pub fn replay(&self, connection: &Arc<ActiveConnection>) -> usize {
        let mut state = self.state.lock();
        state.by_subscription.clear();

        let mut pending = Vec::new();
        for (topic, entry) in state.topics.iter_mut() {
            entry.binding = None;
            if !entry.listeners.is_empty() {
                pending.push(topic.clone());
            }
        }

        let mut replayed = 0;
        for topic in pending {
            let subscription_id = self.new_subscription_id();
            match connection.subscribe(&subscription_id, &topic) {
                // A failed write takes the link down and triggers another replay.
                Ok(_pending) => {
                    state.bind(&topic, subscription_id, connection);
                    replayed += 1;
                }
                Err(e) => warn!("Failed to resubscribe to '{}': {}", topic, e),
            }
        }
        if replayed > 0 {
            debug!(
                "Replayed {} subscription(s) on connection #{}.",
                replayed,
                connection.id()
            );
        }
        replayed
    }

    /// Delivers a MESSAGE frame to every listener of its topic, in registration
    /// order. Returns how many listeners were invoked.
    pub fn dispatch(&self, frame: &StompFrame) -> usize {
        let (topic, listeners) = {
            let state = self.state.lock();
            // Destination routing is only for brokers that omit the header; an
            // unknown subscription id belongs to a cancelled subscription.
            let resolved = match frame.get_header("subscription") {
                Some(id) => state
                    .by_subscription
                    .get(id)
                    .and_then(|topic| state.topics.get_key_value(topic)),
                None => frame
                    .get_header("destination")
                    .and_then(|d| state.topics.get_key_value(d)),
            };
            let Some((topic, entry)) = resolved else {
                debug!(
                    "Dropping MESSAGE for unknown subscription {:?} / destination {:?}.",
                    frame.get_header("subscription"),
                    frame.get_header("destination")
                );
                return 0;
            };
            let listeners: Vec<Listener> = entry.listeners.values().cloned().collect();
            (topic.clone(), listeners)
        };

        if listeners.is_empty() {
            return 0;
        }
        let message = InboundMessage::from_frame(&topic, frame);
        for listener in &listeners {
            listener(&message);
        }
        listeners.len()
    }

    /// Forgets every topic and listener.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let topics = state.topics.len();
        state.topics.clear();
        state.by_subscription.clear();
        if topics > 0 {
            debug!("Cleared {} topic(s) from the subscription registry.", topics);
        }
    }

    /// Returns every known topic, including ones whose listeners are all gone.
    pub fn topics(&self) -> Vec<String> {
        self.state.lock().topics.keys().cloned().collect()
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .topics
            .get(topic)
            .map_or(0, |entry| entry.listeners.len())
    }

    /// Returns whether `topic` is currently backed by a protocol subscription.
    pub fn is_bound(&self, topic: &str) -> bool {
        self.state
            .lock()
            .topics
            .get(topic)
            .and_then(|entry| entry.binding.as_ref())
            .is_some()
    }
}
