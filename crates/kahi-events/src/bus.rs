//! Synchronous in-process pub/sub dispatcher keyed by event type.
//!
//! Handlers registered for a type run in registration order on the
//! publishing task.  Publish snapshots the handler list under a read
//! lock and invokes handlers after releasing it, so a handler may
//! re-enter the bus (publish or subscribe); a re-entrant publish sees
//! only subscriptions that existed at snapshot time.  A panicking
//! handler is caught and logged and never prevents later handlers from
//! running.

use crate::event::{Event, EventType};
use chrono::Utc;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Registration {
    id: u64,
    handler: Handler,
}

/// Thread-safe event dispatcher.  Cheap to share behind an `Arc`.
pub struct EventBus {
    subscriptions: RwLock<HashMap<EventType, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `handler` for `event_type`.  Returns a subscription id
    /// that is unique for the lifetime of the bus and never reused.
    pub fn subscribe(
        &self,
        event_type: EventType,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions
            .write()
            .entry(event_type)
            .or_default()
            .push(Registration {
                id,
                handler: Arc::new(handler),
            });
        id
    }

    /// Remove the subscription with `id`.  Removing an unknown id is a
    /// no-op.  A type whose last subscription is removed is dropped from
    /// the map entirely.
    pub fn unsubscribe(&self, id: u64) {
        let mut subscriptions = self.subscriptions.write();
        for registrations in subscriptions.values_mut() {
            registrations.retain(|registration| registration.id != id);
        }
        subscriptions.retain(|_, registrations| !registrations.is_empty());
    }

    /// Dispatch `event` to every handler registered for its type, in
    /// registration order.  A `None` timestamp is stamped with the
    /// current instant; a set timestamp is preserved verbatim.  Returns
    /// immediately, without copying handlers, when nobody is subscribed.
    pub fn publish(&self, mut event: Event) {
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now());
        }
        let handlers: Vec<Handler> = {
            let subscriptions = self.subscriptions.read();
            match subscriptions.get(&event.event_type) {
                Some(registrations) => registrations
                    .iter()
                    .map(|registration| Arc::clone(&registration.handler))
                    .collect(),
                None => return,
            }
        };
        for handler in handlers {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&event)));
            if let Err(panic) = result {
                tracing::error!(
                    event_type = %event.event_type,
                    panic = %panic_message(panic.as_ref()),
                    "event handler panicked"
                );
            }
        }
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.subscriptions
            .read()
            .get(&event_type)
            .map_or(0, Vec::len)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
