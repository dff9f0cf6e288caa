//! Endpoint table and request dispatch
//!
//! The hub owns the process-wide mapping from endpoint names
//! (`/{service}/{method}`) to handler callables. The table is populated at
//! startup and effectively immutable afterwards: registration is the single
//! writer, dispatch only reads. Handler failures are converted to response
//! data, never allowed to propagate out of the dispatch path.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use tether_protocol::{
    endpoint_name, RemoteError, RequestFrame, ResponseFrame, BUS_SERVICE, HEARTBEAT_METHOD,
};

/// A handler callable registered under an endpoint name.
///
/// Handlers receive the request's positional arguments plus the side-channel
/// call options, and report failure through their `Result`; the hub captures
/// the error into the response frame.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn call(&self, args: Vec<Value>, options: Value) -> anyhow::Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ServiceHandler for FnHandler<F>
where
    F: Fn(Vec<Value>, Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, args: Vec<Value>, options: Value) -> anyhow::Result<Value> {
        (self.0)(args, options).await
    }
}

/// Wrap an async closure as a [`ServiceHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ServiceHandler>
where
    F: Fn(Vec<Value>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// HTTP exposure for an endpoint on the URL-triggered fallback surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

#[derive(Clone)]
struct Endpoint {
    handler: Arc<dyn ServiceHandler>,
    http_method: HttpMethod,
    text_response: bool,
}

/// Endpoint metadata consumed by the HTTP fallback.
#[derive(Debug, Clone, Copy)]
pub struct EndpointMeta {
    pub http_method: HttpMethod,
    pub text_response: bool,
}

/// Duplicate registration is a configuration error: fatal at startup, never
/// silently overwritten.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a service with this name is already registered: {0}")]
    DuplicateEndpoint(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No service registered with name: {0}")]
    NoSuchService(String),
    #[error("{0}")]
    Handler(anyhow::Error),
}

/// Process-wide dispatch authority.
pub struct DispatchHub {
    endpoints: RwLock<HashMap<String, Endpoint>>,
    version: String,
}

impl DispatchHub {
    /// Create a hub with the built-in heartbeat endpoint pre-registered.
    /// Clients probe it to validate connection health without routing
    /// through an arbitrary service.
    pub fn new(version: impl Into<String>) -> Self {
        let version = version.into();

        let reported = version.clone();
        let heartbeat = handler_fn(move |_args, _options| {
            let version = reported.clone();
            async move { Ok(Value::String(version)) }
        });

        let mut endpoints = HashMap::new();
        endpoints.insert(
            endpoint_name(BUS_SERVICE, HEARTBEAT_METHOD),
            Endpoint {
                handler: heartbeat,
                http_method: HttpMethod::Post,
                text_response: true,
            },
        );

        Self {
            endpoints: RwLock::new(endpoints),
            version,
        }
    }

    /// The version string reported by the heartbeat endpoint.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Register a handler under a name with default HTTP exposure (POST,
    /// JSON response).
    pub fn register(
        &self,
        name: &str,
        handler: Arc<dyn ServiceHandler>,
    ) -> Result<(), RegistryError> {
        self.register_service(name, handler, HttpMethod::Post, false)
    }

    /// Register a handler with explicit HTTP exposure. Fails if the name is
    /// already taken; the existing handler is left in place.
    pub fn register_service(
        &self,
        name: &str,
        handler: Arc<dyn ServiceHandler>,
        http_method: HttpMethod,
        text_response: bool,
    ) -> Result<(), RegistryError> {
        let mut endpoints = self.endpoints.write().unwrap();
        if endpoints.contains_key(name) {
            return Err(RegistryError::DuplicateEndpoint(name.to_string()));
        }
        endpoints.insert(
            name.to_string(),
            Endpoint {
                handler,
                http_method,
                text_response,
            },
        );
        debug!(endpoint = name, "Registered service endpoint");
        Ok(())
    }

    pub fn endpoint_meta(&self, name: &str) -> Option<EndpointMeta> {
        self.endpoints.read().unwrap().get(name).map(|endpoint| EndpointMeta {
            http_method: endpoint.http_method,
            text_response: endpoint.text_response,
        })
    }

    /// Invoke a registered endpoint by name.
    pub async fn call_endpoint(
        &self,
        name: &str,
        args: Vec<Value>,
        options: Value,
    ) -> Result<Value, DispatchError> {
        let handler = {
            let endpoints = self.endpoints.read().unwrap();
            endpoints.get(name).map(|endpoint| endpoint.handler.clone())
        };
        let Some(handler) = handler else {
            return Err(DispatchError::NoSuchService(name.to_string()));
        };
        handler.call(args, options).await.map_err(DispatchError::Handler)
    }

    /// Route one inbound request frame to its handler and build the response
    /// frame. Dispatch for each frame is logically independent: a failing
    /// handler produces an error response and nothing else.
    pub async fn dispatch(&self, request: RequestFrame) -> ResponseFrame {
        let name = endpoint_name(&request.service_name, &request.method_name);
        match self
            .call_endpoint(&name, request.method_args, request.service_options)
            .await
        {
            Ok(result) => ResponseFrame::success(request.request_id, result),
            Err(DispatchError::NoSuchService(_)) => {
                debug!(endpoint = %name, "Request for unregistered endpoint");
                ResponseFrame::failure(
                    request.request_id,
                    RemoteError::new(format!("No service registered with name: {}", name)),
                )
            }
            Err(DispatchError::Handler(e)) => {
                error!(endpoint = %name, error = %e, "Handler failed");
                ResponseFrame::failure(request.request_id, RemoteError::new(e.to_string()))
            }
        }
    }
}

/// Extract a required string argument from a request's positional args.
pub fn str_arg(args: &[Value], index: usize, name: &str) -> anyhow::Result<String> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("missing or invalid argument '{}'", name))
}
