//! Typed local delivery fan-out.
//!
//! Feature modules register interest by classification and get a
//! cancellable handle back. Callbacks run on the relay task and must not
//! block; a panicking subscriber is isolated and logged, never fatal to
//! the relay path.

use emberlink_core::{Classification, Message};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error};

/// Callback invoked for each locally delivered message.
pub type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;

struct Subscriber {
    classification: Option<Classification>,
    callback: MessageCallback,
}

struct RegistryInner {
    next_id: u64,
    subscribers: HashMap<u64, Subscriber>,
}

/// Registry of local message subscribers keyed by classification.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                next_id: 0,
                subscribers: HashMap::new(),
            })),
        }
    }

    /// Register a callback for messages of `classification`.
    ///
    /// `None` subscribes to every classification. The subscription stays
    /// active until [`Subscription::cancel`] is called; dropping the handle
    /// alone does not unsubscribe.
    pub fn subscribe<F>(&self, classification: Option<Classification>, callback: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(
            id,
            Subscriber {
                classification,
                callback: Arc::new(callback),
            },
        );
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Fan a delivered message out to matching subscribers.
    ///
    /// Returns the number of callbacks invoked.
    pub fn dispatch(&self, message: &Message) -> usize {
        let callbacks: Vec<MessageCallback> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .subscribers
                .values()
                .filter(|s| {
                    s.classification.is_none() || s.classification == Some(message.classification)
                })
                .map(|s| s.callback.clone())
                .collect()
        };

        let mut invoked = 0;
        for callback in callbacks {
            let result = catch_unwind(AssertUnwindSafe(|| callback(message)));
            if result.is_err() {
                error!(message_id = %message.id, "Subscriber panicked during dispatch");
            } else {
                invoked += 1;
            }
        }

        debug!(
            message_id = %message.id,
            subscribers = invoked,
            "Local delivery dispatched"
        );
        invoked
    }

    /// Number of active subscriptions.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subscribers
            .len()
    }

    /// Whether no subscriptions are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellable handle for one registered subscriber.
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<RegistryInner>>,
}

impl Subscription {
    /// Remove the subscriber from the registry.
    pub fn cancel(self) {
        if let Some(inner) = self.registry.upgrade() {
            inner
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .subscribers
                .remove(&self.id);
        }
    }
}
