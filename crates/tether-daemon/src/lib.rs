//! Tether service bus daemon
//!
//! Library for running the tether daemon: a unix socket server that
//! multiplexes request/response calls and event subscriptions for many
//! logical clients, with an HTTP fallback for callers that cannot hold a
//! persistent socket.

pub mod dispatch;
pub mod http;
pub mod lifecycle;
pub mod registry;
pub mod server;
pub mod subscription;

pub use dispatch::{
    handler_fn, str_arg, DispatchError, DispatchHub, EndpointMeta, HttpMethod, RegistryError,
    ServiceHandler,
};
pub use lifecycle::DaemonPaths;
pub use registry::{ClientId, ClientRegistry};
pub use server::{Server, VersionedDispatch};
pub use subscription::SubscriptionRouter;
