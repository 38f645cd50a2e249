//! Process-wide event bus with deterministic synchronous dispatch.
//!
//! Listeners are keyed by event name and fire in registration order. The bus
//! carries JSON payloads so modules can exchange events without sharing
//! types.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde_json::Value as JsonValue;

type Listener = Arc<dyn Fn(&JsonValue) + Send + Sync>;

/// Identifies a registered listener for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

struct ListenerEntry {
    id: ListenerId,
    listener: Listener,
}

#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<String, Vec<ListenerEntry>>>,
    next_id: AtomicU64,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to an event by name.
    pub fn on<F>(&self, event: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&JsonValue) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .write()
            .entry(event.into())
            .or_default()
            .push(ListenerEntry {
                id,
                listener: Arc::new(listener),
            });
        id
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn off(&self, event: &str, id: ListenerId) {
        if let Some(entries) = self.listeners.write().get_mut(event) {
            entries.retain(|entry| entry.id != id);
        }
    }

    /// Dispatch synchronously, in registration order. Listeners registered
    /// during dispatch see the next emit, not this one.
    pub fn emit(&self, event: &str, payload: &JsonValue) {
        let snapshot: Vec<Listener> = self
            .listeners
            .read()
            .get(event)
            .map(|entries| entries.iter().map(|e| e.listener.clone()).collect())
            .unwrap_or_default();
        for listener in snapshot {
            listener(payload);
        }
    }

    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .read()
            .get(event)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn listeners_fire_in_registration_order() {
        let bus = EventBus::new();
        let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

        for tag in [1i64, 2, 3] {
            let seen = seen.clone();
            bus.on("tick", move |payload| {
                seen.lock().unwrap().push(tag * 10 + payload.as_i64().unwrap_or(0));
            });
        }
        bus.emit("tick", &json!(7));
        assert_eq!(seen.lock().unwrap().as_slice(), &[17, 27, 37]);
    }

    #[test]
    fn off_removes_a_listener() {
        let bus = EventBus::new();
        let seen: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));

        let sink = seen.clone();
        let id = bus.on("ping", move |_| *sink.lock().unwrap() += 1);
        bus.emit("ping", &JsonValue::Null);
        bus.off("ping", id);
        bus.emit("ping", &JsonValue::Null);

        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(bus.listener_count("ping"), 0);
    }

    #[test]
    fn other_events_do_not_cross_talk() {
        let bus = EventBus::new();
        let seen: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
        let sink = seen.clone();
        bus.on("a", move |_| *sink.lock().unwrap() += 1);
        bus.emit("b", &JsonValue::Null);
        assert_eq!(*seen.lock().unwrap(), 0);
    }
}
