//! Event Bus
//!
//! Synchronous publish/subscribe for [`MutationEvent`]s.
//!
//! - `emit` calls every matching listener in subscription order before returning
//! - a listener returning an error or panicking is logged and skipped; the
//!   remaining listeners still receive the event
//! - async listeners are spawned on the ambient tokio runtime and never awaited
//!   by `emit`; callers must not assume they have completed
//!
//! The bus is owned by the graph context and handed to the store and services
//! explicitly; there is no global instance.

use super::events::{EventFilter, MutationEvent};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

/// Identifier of a registered listener
pub type ListenerId = u64;

type SyncListener = Arc<dyn Fn(&MutationEvent) -> anyhow::Result<()> + Send + Sync>;
type AsyncListener = Arc<
    dyn Fn(MutationEvent) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send
        + Sync,
>;

#[derive(Clone)]
enum ListenerKind {
    Sync(SyncListener),
    Async(AsyncListener),
}

#[derive(Clone)]
struct ListenerEntry {
    id: ListenerId,
    filter: Option<EventFilter>,
    listener: ListenerKind,
}

/// Synchronous mutation event dispatcher
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<ListenerEntry>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a synchronous listener.
    ///
    /// Returns a handle whose [`EventSubscription::unsubscribe`] removes the
    /// listener again.
    pub fn subscribe<F>(self: &Arc<Self>, filter: Option<EventFilter>, listener: F) -> EventSubscription
    where
        F: Fn(&MutationEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(filter, ListenerKind::Sync(Arc::new(listener)))
    }

    /// Register an asynchronous listener.
    ///
    /// Each matching event is cloned into a spawned task. Completion is not
    /// awaited by `emit`.
    pub fn subscribe_async<F, Fut>(
        self: &Arc<Self>,
        filter: Option<EventFilter>,
        listener: F,
    ) -> EventSubscription
    where
        F: Fn(MutationEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let wrapped: AsyncListener = Arc::new(move |event| Box::pin(listener(event)));
        self.register(filter, ListenerKind::Async(wrapped))
    }

    fn register(self: &Arc<Self>, filter: Option<EventFilter>, listener: ListenerKind) -> EventSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ListenerEntry {
                id,
                filter,
                listener,
            });
        EventSubscription {
            id,
            bus: Arc::downgrade(self),
        }
    }

    /// Remove a listener. Returns false if it was already removed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Dispatch an event to all matching listeners.
    ///
    /// Returns the number of listeners the event was delivered to (including
    /// ones that failed).
    pub fn emit(&self, event: &MutationEvent) -> usize {
        // Snapshot so listeners may (un)subscribe while being called
        let listeners: Vec<ListenerEntry> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut delivered = 0;
        for entry in listeners {
            if let Some(filter) = &entry.filter {
                if !filter.matches(event) {
                    continue;
                }
            }
            delivered += 1;

            match &entry.listener {
                ListenerKind::Sync(listener) => {
                    match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::error!(
                            "Event listener {} failed on {} for node {}: {:#}",
                            entry.id,
                            event.event_type,
                            event.node_id,
                            e
                        ),
                        Err(_) => tracing::error!(
                            "Event listener {} panicked on {} for node {}",
                            entry.id,
                            event.event_type,
                            event.node_id
                        ),
                    }
                }
                ListenerKind::Async(listener) => match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        let future = listener(event.clone());
                        let listener_id = entry.id;
                        let event_type = event.event_type;
                        handle.spawn(async move {
                            if let Err(e) = future.await {
                                tracing::error!(
                                    "Async event listener {} failed on {}: {:#}",
                                    listener_id,
                                    event_type,
                                    e
                                );
                            }
                        });
                    }
                    Err(_) => tracing::warn!(
                        "No tokio runtime available; dropping {} for async listener {}",
                        event.event_type,
                        entry.id
                    ),
                },
            }
        }
        delivered
    }
}

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug)]
pub struct EventSubscription {
    id: ListenerId,
    bus: Weak<EventBus>,
}

impl EventSubscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the listener. Safe to call after the bus is dropped.
    pub fn unsubscribe(&self) -> bool {
        self.bus
            .upgrade()
            .map(|bus| bus.unsubscribe(self.id))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::events::MutationEventType;
    use std::sync::Mutex;

    fn event(event_type: MutationEventType, node_id: &str) -> MutationEvent {
        MutationEvent::new(event_type, node_id)
    }

    #[test]
    fn test_delivery_in_subscription_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let log = log.clone();
            bus.subscribe(None, move |_| {
                log.lock().unwrap().push(name);
                Ok(())
            });
        }

        let delivered = bus.emit(&event(MutationEventType::NodeCreated, "n1"));
        assert_eq!(delivered, 3);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_failing_listener_does_not_block_others() {
        let bus = EventBus::new();
        let received = Arc::new(Mutex::new(0));

        bus.subscribe(None, |_| Err(anyhow::anyhow!("boom")));
        bus.subscribe(None, |_| panic!("listener panic"));
        let counter = received.clone();
        bus.subscribe(None, move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        bus.emit(&event(MutationEventType::NodeUpdated, "n1"));
        bus.emit(&event(MutationEventType::NodeUpdated, "n2"));
        assert_eq!(*received.lock().unwrap(), 2);
    }

    #[test]
    fn test_filtered_listener() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(Some(EventFilter::for_node("n2")), move |e| {
            sink.lock().unwrap().push(e.node_id.clone());
            Ok(())
        });

        bus.emit(&event(MutationEventType::NodeCreated, "n1"));
        bus.emit(&event(MutationEventType::NodeCreated, "n2"));
        assert_eq!(*seen.lock().unwrap(), vec!["n2".to_string()]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let counter = count.clone();
        let subscription = bus.subscribe(None, move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        bus.emit(&event(MutationEventType::NodeCreated, "n1"));
        assert!(subscription.unsubscribe());
        assert!(!subscription.unsubscribe());
        bus.emit(&event(MutationEventType::NodeCreated, "n2"));

        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_async_listener_is_not_awaited() {
        let bus = EventBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        bus.subscribe_async(None, move |e: MutationEvent| {
            let tx = tx.clone();
            async move {
                tokio::task::yield_now().await;
                tx.send(e.node_id)?;
                Ok(())
            }
        });

        assert_eq!(bus.emit(&event(MutationEventType::NodeDeleted, "n9")), 1);
        let received = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("async listener should run")
            .expect("channel open");
        assert_eq!(received, "n9");
    }
}
