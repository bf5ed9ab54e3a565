//! Event dispatch: per-kind subscriber lists with detachable handles.

use fusebox_types::{BreakerEvent, EventKind};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Event listener. Delivery is synchronous from the emitting site, so
/// handlers must not block.
pub type Listener = Arc<dyn Fn(&BreakerEvent) + Send + Sync>;

/// Handle returned by [`EventDispatcher::subscribe`], used to detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Per-breaker event dispatcher. Subscriber lists are keyed by event
/// kind; per-subscriber ordering follows subscription order.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: RwLock<HashMap<EventKind, Vec<(SubscriptionId, Listener)>>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().entry(kind).or_default().push((id, listener));
        id
    }

    /// Detach one listener. Returns false if the id was already gone.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        match listeners.get_mut(&kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|(sub_id, _)| *sub_id != id);
                before != list.len()
            },
            None => false,
        }
    }

    /// Deliver an event to every subscriber of its kind. Listeners run
    /// outside the lock so a handler may subscribe or detach.
    pub fn emit(&self, event: &BreakerEvent) {
        let snapshot: Vec<Listener> = {
            let listeners = self.listeners.read();
            match listeners.get(&event.kind()) {
                Some(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
                None => return,
            }
        };
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.read().get(&kind).map_or(0, Vec::len)
    }

    /// Detach everything.
    pub fn clear(&self) {
        self.listeners.write().clear();
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("kinds", &self.listeners.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn state_change() -> BreakerEvent {
        BreakerEvent::StateChange {
            service: "svc".into(),
            from: fusebox_types::CircuitState::Closed,
            to: fusebox_types::CircuitState::Open,
        }
    }

    #[test]
    fn delivers_to_matching_kind_only() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(Mutex::new(Vec::new()));

        let hits_clone = Arc::clone(&hits);
        dispatcher.subscribe(
            EventKind::StateChange,
            Arc::new(move |ev| hits_clone.lock().push(ev.kind())),
        );
        let hits_clone = Arc::clone(&hits);
        dispatcher.subscribe(
            EventKind::Failure,
            Arc::new(move |ev| hits_clone.lock().push(ev.kind())),
        );

        dispatcher.emit(&state_change());
        assert_eq!(*hits.lock(), vec![EventKind::StateChange]);
    }

    #[test]
    fn unsubscribe_detaches_one_listener() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(Mutex::new(0usize));

        let hits_a = Arc::clone(&hits);
        let id = dispatcher
            .subscribe(EventKind::StateChange, Arc::new(move |_| *hits_a.lock() += 1));
        let hits_b = Arc::clone(&hits);
        dispatcher.subscribe(EventKind::StateChange, Arc::new(move |_| *hits_b.lock() += 1));

        assert!(dispatcher.unsubscribe(EventKind::StateChange, id));
        assert!(!dispatcher.unsubscribe(EventKind::StateChange, id));

        dispatcher.emit(&state_change());
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn subscription_order_is_preserved() {
        let dispatcher = EventDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            dispatcher.subscribe(EventKind::StateChange, Arc::new(move |_| order.lock().push(tag)));
        }

        dispatcher.emit(&state_change());
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn clear_removes_all_listeners() {
        let dispatcher = EventDispatcher::new();
        dispatcher.subscribe(EventKind::Metrics, Arc::new(|_| {}));
        dispatcher.subscribe(EventKind::Failure, Arc::new(|_| {}));
        dispatcher.clear();
        assert_eq!(dispatcher.listener_count(EventKind::Metrics), 0);
        assert_eq!(dispatcher.listener_count(EventKind::Failure), 0);
    }
}
