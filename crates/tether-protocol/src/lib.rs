//! Wire protocol for the tether service bus
//!
//! Every message exchanged over a bus socket is one newline-delimited JSON
//! frame, tagged with a channel (or protocol) discriminator that selects its
//! decoding path. Both the daemon and the client link this crate so the two
//! ends agree on frame shapes and event-name derivation without any central
//! allocation step.
//!
//! Uses serde for serialization - can swap to bincode/messagepack later.

pub mod frames;

pub use frames::{
    endpoint_name, remote_event_name, DecodeError, EventFrame, EventPayload, Frame, HelloFrame,
    RemoteError, RequestFrame, RequestId, ResponseFrame, VersionedRequestFrame,
    VersionedResponseFrame, BUS_SERVICE, EVENT_CHANNEL, HEARTBEAT_METHOD, RPC_CHANNEL,
    SUBSCRIBE_METHOD, UNSUBSCRIBE_METHOD, VERSIONED_PROTOCOL,
};
