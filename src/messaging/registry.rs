//! Registry of active subscriptions.
//!
//! The registry is the single source of truth for what must be replayed after
//! a reconnect. Entries are only added or overwritten, never removed while the
//! consumer runs. All access goes through one mutex that is never held across
//! an `.await`; replay iterates a [`SubscriptionRegistry::snapshot`] instead.

use crate::messaging::dispatcher::DispatcherHandle;
use crate::messaging::handler::MessageHandler;
use crate::messaging::options::ConsumeOptions;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// One registered subscription: queue name, resolved options and handler
#[derive(Clone)]
pub struct Subscription {
    /// Queue (and routing key) name
    pub queue: String,

    /// Options resolved at registration
    pub options: Arc<ConsumeOptions>,

    /// Handler invoked for every delivery
    pub handler: Arc<dyn MessageHandler>,

    /// Identifies this registration; changes when the name is re-registered
    pub registration_id: u64,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("queue", &self.queue)
            .field("options", &self.options)
            .field("registration_id", &self.registration_id)
            .finish()
    }
}

struct Entry {
    subscription: Subscription,
    dispatcher: Option<DispatcherHandle>,
    generation: u64,
    order: u64,
}

/// Thread-safe map from queue name to its subscription
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    /// Create a new registry
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Build a subscription with a fresh registration id
    pub fn prepare(
        &self,
        queue: impl Into<String>,
        options: ConsumeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Subscription {
        Subscription {
            queue: queue.into(),
            options: Arc::new(options),
            handler,
            registration_id: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Record a subscription bound to connection `generation`.
    ///
    /// Overwrites any entry under the same queue name (last writer wins) and
    /// returns the previous dispatcher so the caller can stop it. The
    /// original registration order is kept for replay.
    pub fn add(
        &self,
        subscription: Subscription,
        dispatcher: DispatcherHandle,
        generation: u64,
    ) -> Option<DispatcherHandle> {
        let mut entries = self.entries.lock();
        let queue = subscription.queue.clone();

        match entries.get_mut(&queue) {
            Some(entry) => {
                debug!(
                    queue = %queue,
                    previous = entry.subscription.registration_id,
                    current = subscription.registration_id,
                    "Overwriting subscription"
                );
                entry.subscription = subscription;
                entry.generation = generation;
                entry.dispatcher.replace(dispatcher)
            }
            None => {
                let order = self.next_id.fetch_add(1, Ordering::Relaxed);
                info!(queue = %queue, generation, "Registered subscription");
                entries.insert(
                    queue,
                    Entry {
                        subscription,
                        dispatcher: Some(dispatcher),
                        generation,
                        order,
                    },
                );
                None
            }
        }
    }

    /// Attach a new dispatcher to an existing registration after replay.
    ///
    /// Succeeds only if `registration_id` still identifies the entry; the
    /// replaced dispatcher is returned. When the entry has been overwritten in
    /// the meantime, the rejected dispatcher is handed back as the error.
    pub fn rebind(
        &self,
        queue: &str,
        registration_id: u64,
        dispatcher: DispatcherHandle,
        generation: u64,
    ) -> Result<Option<DispatcherHandle>, DispatcherHandle> {
        let mut entries = self.entries.lock();
        match entries.get_mut(queue) {
            Some(entry) if entry.subscription.registration_id == registration_id => {
                entry.generation = generation;
                Ok(entry.dispatcher.replace(dispatcher))
            }
            _ => Err(dispatcher),
        }
    }

    /// Point-in-time copy of every subscription, in registration order
    pub fn snapshot(&self) -> Vec<Subscription> {
        let entries = self.entries.lock();
        let mut ordered: Vec<(&u64, &Subscription)> = entries
            .values()
            .map(|entry| (&entry.order, &entry.subscription))
            .collect();
        ordered.sort_by_key(|(order, _)| **order);
        ordered
            .into_iter()
            .map(|(_, subscription)| subscription.clone())
            .collect()
    }

    /// Get the subscription registered under `queue`
    pub fn get(&self, queue: &str) -> Option<Subscription> {
        self.entries
            .lock()
            .get(queue)
            .map(|entry| entry.subscription.clone())
    }

    /// Connection generation the subscription is currently bound to
    pub fn generation(&self, queue: &str) -> Option<u64> {
        self.entries.lock().get(queue).map(|entry| entry.generation)
    }

    /// Take every dispatcher out of the registry, leaving the subscriptions
    pub fn take_dispatchers(&self) -> Vec<DispatcherHandle> {
        self.entries
            .lock()
            .values_mut()
            .filter_map(|entry| entry.dispatcher.take())
            .collect()
    }

    /// Registered queue names, in registration order
    pub fn names(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .map(|subscription| subscription.queue)
            .collect()
    }

    /// Get the total number of subscriptions
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
