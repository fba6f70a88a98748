use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// What kind of mutation produced the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Add,
    Update,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationEvent {
    pub table: String,
    pub kind: EventKind,
}

type Handler = Box<dyn Fn(&MutationEvent) + Send + 'static>;

struct Subscriber {
    id: u64,
    filter: Option<String>,
    handler: Handler,
}

/// Broadcaster for table-scoped mutation events. Delivery is synchronous, in commit order, in
/// the caller's context: subscribers observe mutations as an explicit object the controller
/// owns, rather than through a host-specific hook mechanism.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    next_id: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self { subscribers: Arc::new(Mutex::new(Vec::new())), next_id: Arc::new(AtomicU64::new(1)) }
    }

    /// Register a handler, optionally scoped to one table. Returns an owned `Subscription`;
    /// dropping it (or calling `unsubscribe` explicitly) removes the handler, leaking nothing.
    pub fn subscribe(
        &self,
        filter: Option<String>,
        handler: impl Fn(&MutationEvent) + Send + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().push(Subscriber { id, filter, handler: Box::new(handler) });
        Subscription { bus: self.subscribers.clone(), id }
    }

    pub fn publish(&self, event: MutationEvent) {
        let subs = self.subscribers.lock().unwrap();
        for sub in subs.iter() {
            match &sub.filter {
                Some(table) if *table != event.table => continue,
                _ => (sub.handler)(&event),
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

/// An owned disposer for one `EventBus::subscribe` registration.
pub struct Subscription {
    bus: Arc<Mutex<Vec<Subscriber>>>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the actual work; this just gives callers an explicit verb to use.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.lock().unwrap().retain(|s| s.id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn filtered_subscriber_only_sees_its_table() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let _sub = bus.subscribe(Some("trips".into()), move |_e| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(MutationEvent { table: "trips".into(), kind: EventKind::Add });
        bus.publish(MutationEvent { table: "users".into(), kind: EventKind::Add });

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_leaks_nothing() {
        let bus = EventBus::new();
        let sub = bus.subscribe(None, |_e| {});
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
