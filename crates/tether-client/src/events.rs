//! Local event listener table
//!
//! Holds the callbacks registered for remote events on this client. The
//! emitter is purely local bookkeeping; server-side subscription state is
//! managed by the client's subscribe/unsubscribe calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

pub type EventCallback = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Token identifying one registered callback, for removal.
pub type ListenerToken = u64;

/// Dispatches incoming event frames to the callbacks registered for their
/// event name. Events with no listeners are dropped silently; that is the
/// normal state right after an unsubscribe races an in-flight event.
pub struct LocalEventEmitter {
    listeners: Mutex<HashMap<String, Vec<(ListenerToken, EventCallback)>>>,
    next_token: AtomicU64,
}

impl LocalEventEmitter {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn add_listener(&self, event_name: &str, callback: EventCallback) -> ListenerToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.listeners.lock().unwrap();
        listeners
            .entry(event_name.to_string())
            .or_default()
            .push((token, callback));
        token
    }

    /// Remove one callback. Removing an already-removed token is a no-op.
    pub fn remove_listener(&self, event_name: &str, token: ListenerToken) {
        let mut listeners = self.listeners.lock().unwrap();
        if let Some(callbacks) = listeners.get_mut(event_name) {
            callbacks.retain(|(t, _)| *t != token);
            if callbacks.is_empty() {
                listeners.remove(event_name);
            }
        }
    }

    pub fn listener_count(&self, event_name: &str) -> usize {
        self.listeners
            .lock()
            .unwrap()
            .get(event_name)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Invoke every callback registered for this event name.
    ///
    /// Callbacks are cloned out before invocation so a callback that
    /// registers or removes listeners does not deadlock on the table.
    pub fn emit(&self, event_name: &str, args: &[Value]) {
        let callbacks: Vec<EventCallback> = {
            let listeners = self.listeners.lock().unwrap();
            match listeners.get(event_name) {
                Some(callbacks) => callbacks.iter().map(|(_, cb)| cb.clone()).collect(),
                None => {
                    debug!(event = event_name, "Dropping event with no local listeners");
                    return;
                }
            }
        };
        for callback in callbacks {
            callback(args);
        }
    }
}

impl Default for LocalEventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
