//! Event fan-out to subscribed clients
//!
//! Tracks which client ids are interested in which event names and pushes a
//! framed event message through each subscriber's transport when the event
//! fires. Event names are derived deterministically from service name,
//! method name and call options (see `tether_protocol::remote_event_name`),
//! so subscribers and the firing handler agree on identity without a central
//! allocation step.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{debug, warn};

use tether_protocol::EventFrame;

use crate::registry::{ClientId, ClientRegistry};

/// Routes fired events to the set of clients subscribed to them.
///
/// Subscription state is mutated by the subscribe/unsubscribe endpoints and
/// read by the publish path. Both operations are idempotent: subscribing
/// twice is the same as once, unsubscribing an absent id is a no-op.
pub struct SubscriptionRouter {
    registry: Arc<ClientRegistry>,
    /// Map from event name -> set of subscribed client ids.
    subscriptions: RwLock<HashMap<String, HashSet<ClientId>>>,
}

impl SubscriptionRouter {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self {
            registry,
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Add a client to an event's subscriber set, creating the set if absent.
    pub fn subscribe(&self, client_id: ClientId, event_name: &str) {
        let mut subscriptions = self.subscriptions.write().unwrap();
        subscriptions
            .entry(event_name.to_string())
            .or_default()
            .insert(client_id.clone());
        debug!(client = %client_id, event = event_name, "Client subscribed");
    }

    /// Remove a client from an event's subscriber set. Removing an absent
    /// id is a no-op, not an error.
    pub fn unsubscribe(&self, client_id: &ClientId, event_name: &str) {
        let mut subscriptions = self.subscriptions.write().unwrap();
        if let Some(clients) = subscriptions.get_mut(event_name) {
            clients.remove(client_id);
            if clients.is_empty() {
                subscriptions.remove(event_name);
            }
        }
        debug!(client = %client_id, event = event_name, "Client unsubscribed");
    }

    /// Whether a client is currently subscribed to an event.
    pub fn is_subscribed(&self, client_id: &ClientId, event_name: &str) -> bool {
        self.subscriptions
            .read()
            .unwrap()
            .get(event_name)
            .is_some_and(|clients| clients.contains(client_id))
    }

    /// Number of subscribers for an event.
    pub fn subscriber_count(&self, event_name: &str) -> usize {
        self.subscriptions
            .read()
            .unwrap()
            .get(event_name)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Push an event frame to every current subscriber of `event_name`.
    ///
    /// Subscribers without a client record are logged and skipped; one bad
    /// subscriber never fails the publish for the rest. Delivery goes
    /// through each client's transport, so disconnected subscribers get the
    /// frame queued for their next reconnect.
    pub async fn publish(&self, event_name: &str, args: Vec<Value>) -> anyhow::Result<()> {
        let subscribers: Vec<ClientId> = {
            let subscriptions = self.subscriptions.read().unwrap();
            subscriptions
                .get(event_name)
                .map(|clients| clients.iter().cloned().collect())
                .unwrap_or_default()
        };

        if subscribers.is_empty() {
            return Ok(());
        }

        let line = EventFrame::new(event_name, args).to_json_line()?;
        for client_id in subscribers {
            if !self.registry.send(&client_id, line.clone()).await {
                warn!(
                    client = %client_id,
                    event = event_name,
                    "Subscriber has no client record, skipping"
                );
            }
        }
        Ok(())
    }
}
