//! Bus client: connection, call correlation, event listeners
//!
//! One client owns one socket to the daemon. Calls from any number of tasks
//! are multiplexed over it: each call takes a fresh request id, parks a
//! oneshot sender in the pending table and waits for the reader task to
//! settle it when the matching response frame arrives. Event frames are
//! routed to the local listener table instead.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tether_protocol::{
    remote_event_name, Frame, HelloFrame, RemoteError, RequestFrame, RequestId,
    VersionedRequestFrame, VersionedResponseFrame, BUS_SERVICE, HEARTBEAT_METHOD,
    SUBSCRIBE_METHOD, UNSUBSCRIBE_METHOD,
};

use crate::events::{EventCallback, ListenerToken, LocalEventEmitter};

/// Timeout for the bookkeeping calls issued by subscription management.
const SUBSCRIPTION_CALL_TIMEOUT: Duration = Duration::from_secs(10);

const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum CallError {
    #[error("call {service}/{method} timed out after {elapsed:?}")]
    Timeout {
        service: String,
        method: String,
        elapsed: Duration,
    },
    #[error("call {service}/{method} failed remotely: {error}")]
    Remote {
        service: String,
        method: String,
        error: RemoteError,
    },
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport write failed: {0}")]
    Transport(#[from] std::io::Error),
    #[error("connection closed before the call settled")]
    ConnectionClosed,
}

struct ClientInner {
    client_id: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Result<Value, RemoteError>>>>,
    versioned_pending: Mutex<HashMap<RequestId, oneshot::Sender<VersionedResponseFrame>>>,
    emitter: LocalEventEmitter,
}

/// A connection to the tether daemon.
///
/// Cheap to share through the returned handles; dropping the client aborts
/// the reader task and closes the socket.
pub struct BusClient {
    inner: Arc<ClientInner>,
    reader: JoinHandle<()>,
}

impl BusClient {
    /// Connect to the daemon socket and identify as `client_id`.
    ///
    /// The id is what ties this connection to any delivery queue the daemon
    /// kept from a previous connection with the same id; use a fresh id for
    /// a clean slate.
    pub async fn connect(socket_path: &Path, client_id: &str) -> anyhow::Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, mut write_half) = stream.into_split();

        let hello = HelloFrame {
            client_id: client_id.to_string(),
        }
        .to_json_line()?;
        write_half.write_all(hello.as_bytes()).await?;

        let inner = Arc::new(ClientInner {
            client_id: client_id.to_string(),
            writer: tokio::sync::Mutex::new(write_half),
            next_request_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            versioned_pending: Mutex::new(HashMap::new()),
            emitter: LocalEventEmitter::new(),
        });

        let reader = tokio::spawn(read_loop(read_half, inner.clone()));

        Ok(Self { inner, reader })
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Call a remote service method and wait for its response.
    ///
    /// On timeout the pending entry is removed immediately, so a response
    /// that arrives later is dropped rather than leaked.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
        options: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        self.inner.call(service, method, args, options, timeout).await
    }

    /// Call over the versioned channel. Error presence is signalled by the
    /// response's explicit flag rather than by field absence.
    pub async fn call_versioned(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
        options: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        self.inner
            .call_versioned(service, method, args, options, timeout)
            .await
    }

    /// Probe the daemon's built-in heartbeat endpoint. Returns the daemon's
    /// version string on success.
    pub async fn test_connection(&self) -> anyhow::Result<String> {
        let result = self
            .call(BUS_SERVICE, HEARTBEAT_METHOD, vec![], Value::Null, HEARTBEAT_TIMEOUT)
            .await?;
        match result {
            Value::String(version) => Ok(version),
            other => anyhow::bail!("unexpected heartbeat payload: {}", other),
        }
    }

    /// Number of calls currently awaiting a response, across both channels.
    pub fn pending_request_count(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
            + self.inner.versioned_pending.lock().unwrap().len()
    }

    /// Listen for a remote event, subscribing on the daemon as a side
    /// effect. The callback starts receiving events as soon as the daemon
    /// processes the subscription.
    ///
    /// Dropping the returned handle only silences the local callback; call
    /// [`EventSubscription::dispose`] to also unsubscribe on the daemon.
    pub fn register_event_listener(
        &self,
        service: &str,
        method: &str,
        options: Value,
        callback: impl Fn(&[Value]) + Send + Sync + 'static,
    ) -> EventSubscription {
        let event_name = remote_event_name(service, method, &options);
        let token = self
            .inner
            .emitter
            .add_listener(&event_name, Arc::new(callback) as EventCallback);

        // The subscribe call runs in the background; the completion signal
        // lets dispose order its unsubscribe after it.
        let (done_tx, done_rx) = oneshot::channel();
        let inner = self.inner.clone();
        let sub_service = service.to_string();
        let sub_method = method.to_string();
        let sub_options = options.clone();
        tokio::spawn(async move {
            let args = vec![
                Value::String(inner.client_id.clone()),
                Value::String(sub_service.clone()),
                Value::String(sub_method.clone()),
            ];
            if let Err(e) = inner
                .call(
                    BUS_SERVICE,
                    SUBSCRIBE_METHOD,
                    args,
                    sub_options,
                    SUBSCRIPTION_CALL_TIMEOUT,
                )
                .await
            {
                warn!(
                    service = %sub_service,
                    method = %sub_method,
                    error = %e,
                    "Event subscription call failed"
                );
            }
            let _ = done_tx.send(());
        });

        EventSubscription {
            inner: self.inner.clone(),
            event_name,
            service: service.to_string(),
            method: method.to_string(),
            options,
            token,
            subscribe_done: Some(done_rx),
        }
    }
}

impl Drop for BusClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl ClientInner {
    async fn call(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
        options: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let line = RequestFrame {
            service_name: service.to_string(),
            method_name: method.to_string(),
            method_args: args,
            service_options: options,
            request_id,
        }
        .to_json_line()?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(request_id, tx);

        if let Err(e) = self.write_line(&line).await {
            self.pending.lock().unwrap().remove(&request_id);
            return Err(CallError::Transport(e));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(CallError::Remote {
                service: service.to_string(),
                method: method.to_string(),
                error,
            }),
            Ok(Err(_)) => Err(CallError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().unwrap().remove(&request_id);
                Err(CallError::Timeout {
                    service: service.to_string(),
                    method: method.to_string(),
                    elapsed: timeout,
                })
            }
        }
    }

    async fn call_versioned(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
        options: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let line = VersionedRequestFrame::new(service, method, args, options, request_id)
            .to_json_line()?;

        let (tx, rx) = oneshot::channel();
        self.versioned_pending.lock().unwrap().insert(request_id, tx);

        if let Err(e) = self.write_line(&line).await {
            self.versioned_pending.lock().unwrap().remove(&request_id);
            return Err(CallError::Transport(e));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                if response.had_error {
                    let message = match response.error {
                        Some(Value::String(s)) => s,
                        Some(other) => other.to_string(),
                        None => "unspecified remote error".to_string(),
                    };
                    Err(CallError::Remote {
                        service: service.to_string(),
                        method: method.to_string(),
                        error: RemoteError::new(message),
                    })
                } else {
                    Ok(response.result.unwrap_or(Value::Null))
                }
            }
            Ok(Err(_)) => Err(CallError::ConnectionClosed),
            Err(_) => {
                self.versioned_pending.lock().unwrap().remove(&request_id);
                Err(CallError::Timeout {
                    service: service.to_string(),
                    method: method.to_string(),
                    elapsed: timeout,
                })
            }
        }
    }

    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await
    }

    fn settle(&self, request_id: RequestId, outcome: Result<Value, RemoteError>) {
        let Some(tx) = self.pending.lock().unwrap().remove(&request_id) else {
            debug!(request_id, "Dropping response with no pending call");
            return;
        };
        let _ = tx.send(outcome);
    }

    fn settle_versioned(&self, response: VersionedResponseFrame) {
        let request_id = response.request_id;
        let Some(tx) = self.versioned_pending.lock().unwrap().remove(&request_id) else {
            debug!(request_id, "Dropping versioned response with no pending call");
            return;
        };
        let _ = tx.send(response);
    }
}

/// Reader task: routes every inbound frame to the pending table or the
/// event emitter. Outstanding calls are deliberately left in the pending
/// table when the socket closes; they settle through their own timeouts.
async fn read_loop(read_half: OwnedReadHalf, inner: Arc<ClientInner>) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Socket read failed");
                break;
            }
        }
        if line.trim().is_empty() {
            continue;
        }

        match Frame::decode(&line) {
            Ok(Frame::Response(response)) => {
                let outcome = match response.error {
                    Some(error) => Err(error),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                inner.settle(response.request_id, outcome);
            }
            Ok(Frame::Versioned(value)) => match serde_json::from_value(value) {
                Ok(response) => inner.settle_versioned(response),
                Err(e) => {
                    warn!(error = %e, "Undecodable versioned frame");
                }
            },
            Ok(Frame::Event(event)) => {
                inner.emitter.emit(&event.event.name, &event.event.args);
            }
            Ok(_) => {
                debug!("Ignoring client-bound frame of inbound type");
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
            }
        }
    }
    debug!("Reader task finished, socket closed");
}

/// Handle for one registered event listener.
pub struct EventSubscription {
    inner: Arc<ClientInner>,
    event_name: String,
    service: String,
    method: String,
    options: Value,
    token: ListenerToken,
    subscribe_done: Option<oneshot::Receiver<()>>,
}

impl EventSubscription {
    /// The derived event name this subscription listens on.
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// Stop listening and unsubscribe on the daemon.
    ///
    /// The local callback is silenced immediately. The daemon-side
    /// unsubscribe is sent only after the original subscribe call has
    /// settled, so the two cannot arrive out of order.
    pub async fn dispose(mut self) {
        self.inner.emitter.remove_listener(&self.event_name, self.token);

        if let Some(done) = self.subscribe_done.take() {
            let _ = done.await;
        }

        let args = vec![
            Value::String(self.inner.client_id.clone()),
            Value::String(self.service.clone()),
            Value::String(self.method.clone()),
        ];
        if let Err(e) = self
            .inner
            .call(
                BUS_SERVICE,
                UNSUBSCRIBE_METHOD,
                args,
                self.options.clone(),
                SUBSCRIPTION_CALL_TIMEOUT,
            )
            .await
        {
            warn!(event = %self.event_name, error = %e, "Unsubscribe call failed");
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        // Local silencing only. remove_listener is idempotent, so this is
        // safe after dispose has already run.
        self.inner.emitter.remove_listener(&self.event_name, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_error_messages() {
        let timeout = CallError::Timeout {
            service: "fs".to_string(),
            method: "stat".to_string(),
            elapsed: Duration::from_secs(3),
        };
        assert_eq!(timeout.to_string(), "call fs/stat timed out after 3s");

        let remote = CallError::Remote {
            service: "fs".to_string(),
            method: "stat".to_string(),
            error: RemoteError::new("no such file"),
        };
        assert_eq!(remote.to_string(), "call fs/stat failed remotely: no such file");
    }
}
