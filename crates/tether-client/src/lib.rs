//! Client for the tether service bus daemon
//!
//! Connects one logical client to the daemon socket and multiplexes
//! request/response calls and event subscriptions over it.

pub mod client;
pub mod events;

pub use client::{BusClient, CallError, EventSubscription};
pub use events::{EventCallback, ListenerToken, LocalEventEmitter};
