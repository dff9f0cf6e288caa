//! Socket server and per-connection frame loop
//!
//! Accepts connections on a unix domain socket. Every connection must open
//! with a hello frame naming its logical client id; the socket is then bound
//! into the client registry and the loop reads newline-delimited frames until
//! end of stream. Each request frame is dispatched on its own task so a slow
//! or failing handler never stalls other in-flight calls on the same socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tether_protocol::{
    remote_event_name, Frame, BUS_SERVICE, SUBSCRIBE_METHOD, UNSUBSCRIBE_METHOD,
};

use crate::dispatch::{handler_fn, str_arg, DispatchHub};
use crate::registry::{ClientId, ClientRegistry};
use crate::subscription::SubscriptionRouter;

/// Handler for frames carrying a versioned protocol tag.
///
/// Tagged frames bypass the legacy channel decoding entirely and are handed
/// over whole; the implementation owns their schema, correlation and replies
/// (typically through a [`ClientRegistry`] handle captured at construction).
#[async_trait]
pub trait VersionedDispatch: Send + Sync {
    async fn handle(&self, client_id: &ClientId, frame: Value) -> anyhow::Result<()>;
}

/// The daemon's socket server.
///
/// Owns the listener plus the shared dispatch hub, subscription router and
/// client registry. Built-in bus endpoints (heartbeat, subscribe,
/// unsubscribe) are registered at bind time.
pub struct Server {
    listener: UnixListener,
    socket_path: PathBuf,
    registry: Arc<ClientRegistry>,
    hub: Arc<DispatchHub>,
    router: Arc<SubscriptionRouter>,
    versioned: Option<Arc<dyn VersionedDispatch>>,
    shutdown: CancellationToken,
}

impl Server {
    /// Bind the listening socket and assemble the shared state. A stale
    /// socket file left by a previous process is removed first.
    pub async fn bind(socket_path: &Path, version: &str) -> anyhow::Result<Self> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(socket_path)?;
        info!(path = %socket_path.display(), "Listening on socket");

        let registry = Arc::new(ClientRegistry::new());
        let hub = Arc::new(DispatchHub::new(version));
        let router = Arc::new(SubscriptionRouter::new(registry.clone()));

        register_bus_endpoints(&hub, &router)?;

        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            registry,
            hub,
            router,
            versioned: None,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn dispatch_hub(&self) -> Arc<DispatchHub> {
        self.hub.clone()
    }

    pub fn subscription_router(&self) -> Arc<SubscriptionRouter> {
        self.router.clone()
    }

    pub fn client_registry(&self) -> Arc<ClientRegistry> {
        self.registry.clone()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Token that stops the accept loop when cancelled.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Install the handler for versioned-protocol frames. Without one,
    /// tagged frames are logged and dropped.
    pub fn set_versioned_dispatch(&mut self, dispatch: Arc<dyn VersionedDispatch>) {
        self.versioned = Some(dispatch);
    }

    /// Accept connections until the shutdown token fires. Each connection
    /// runs its frame loop on its own task.
    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested, closing listener");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, _addr) = accepted?;
                    let registry = self.registry.clone();
                    let hub = self.hub.clone();
                    let versioned = self.versioned.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, registry, hub, versioned).await;
                    });
                }
            }
        }
        Ok(())
    }
}

/// Wire the subscribe/unsubscribe endpoints into the hub. Both take
/// positional args `[client_id, service_name, method_name]` with the call
/// options carried alongside; the event name is derived from all three so
/// differently-parameterised subscriptions stay distinct.
fn register_bus_endpoints(
    hub: &Arc<DispatchHub>,
    router: &Arc<SubscriptionRouter>,
) -> anyhow::Result<()> {
    let subscribe_router = router.clone();
    hub.register(
        &tether_protocol::endpoint_name(BUS_SERVICE, SUBSCRIBE_METHOD),
        handler_fn(move |args, options| {
            let router = subscribe_router.clone();
            async move {
                let client_id = str_arg(&args, 0, "client_id")?;
                let service = str_arg(&args, 1, "service_name")?;
                let method = str_arg(&args, 2, "method_name")?;
                let event_name = remote_event_name(&service, &method, &options);
                router.subscribe(ClientId::new(client_id), &event_name);
                Ok(Value::String(event_name))
            }
        }),
    )?;

    let unsubscribe_router = router.clone();
    hub.register(
        &tether_protocol::endpoint_name(BUS_SERVICE, UNSUBSCRIBE_METHOD),
        handler_fn(move |args, options| {
            let router = unsubscribe_router.clone();
            async move {
                let client_id = str_arg(&args, 0, "client_id")?;
                let service = str_arg(&args, 1, "service_name")?;
                let method = str_arg(&args, 2, "method_name")?;
                let event_name = remote_event_name(&service, &method, &options);
                router.unsubscribe(&ClientId::new(client_id), &event_name);
                Ok(Value::String(event_name))
            }
        }),
    )?;

    Ok(())
}

/// Per-connection frame loop. The first frame must be a hello; everything
/// after it is decoded by channel and routed.
async fn handle_connection(
    stream: UnixStream,
    registry: Arc<ClientRegistry>,
    hub: Arc<DispatchHub>,
    versioned: Option<Arc<dyn VersionedDispatch>>,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    let client_id = match reader.read_line(&mut line).await {
        Ok(0) => return,
        Ok(_) => match Frame::decode(&line) {
            Ok(Frame::Hello(hello)) => ClientId::new(hello.client_id),
            Ok(_) => {
                warn!("Connection did not open with a hello frame, dropping");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Malformed opening frame, dropping connection");
                return;
            }
        },
        Err(e) => {
            warn!(error = %e, "Failed to read opening frame");
            return;
        }
    };

    let generation = registry.bind(&client_id, write_half).await;
    info!(client = %client_id, "Client connected");

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(client = %client_id, error = %e, "Socket read failed");
                break;
            }
        }
        if line.trim().is_empty() {
            continue;
        }

        match Frame::decode(&line) {
            Ok(Frame::Request(request)) => {
                let registry = registry.clone();
                let hub = hub.clone();
                let client_id = client_id.clone();
                tokio::spawn(async move {
                    let response = hub.dispatch(request).await;
                    match response.to_json_line() {
                        Ok(encoded) => {
                            registry.send(&client_id, encoded).await;
                        }
                        Err(e) => {
                            error!(client = %client_id, error = %e, "Failed to encode response");
                        }
                    }
                });
            }
            Ok(Frame::Versioned(frame)) => match &versioned {
                Some(dispatch) => {
                    let dispatch = dispatch.clone();
                    let client_id = client_id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = dispatch.handle(&client_id, frame).await {
                            error!(client = %client_id, error = %e, "Versioned dispatch failed");
                        }
                    });
                }
                None => {
                    warn!(client = %client_id, "Versioned frame received with no handler installed");
                }
            },
            Ok(Frame::Hello(_)) => {
                debug!(client = %client_id, "Ignoring duplicate hello frame");
            }
            Ok(Frame::Response(_)) | Ok(Frame::Event(_)) => {
                debug!(client = %client_id, "Ignoring server-bound frame of outbound type");
            }
            Err(e) => {
                warn!(client = %client_id, error = %e, "Dropping malformed frame");
            }
        }
    }

    registry.on_close(&client_id, generation).await;
    info!(client = %client_id, "Client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tether_protocol::{EventFrame, HelloFrame, RequestFrame, ResponseFrame};
    use tokio::io::AsyncWriteExt;

    struct TestPeer {
        reader: BufReader<tokio::net::unix::OwnedReadHalf>,
        writer: tokio::net::unix::OwnedWriteHalf,
    }

    impl TestPeer {
        async fn connect(path: &Path, client_id: &str) -> Self {
            let stream = UnixStream::connect(path).await.unwrap();
            let (read_half, writer) = stream.into_split();
            let mut peer = Self {
                reader: BufReader::new(read_half),
                writer,
            };
            let hello = HelloFrame {
                client_id: client_id.to_string(),
            }
            .to_json_line()
            .unwrap();
            peer.writer.write_all(hello.as_bytes()).await.unwrap();
            peer
        }

        async fn send_request(&mut self, frame: &RequestFrame) {
            let line = frame.to_json_line().unwrap();
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        async fn read_frame(&mut self) -> Frame {
            let mut line = String::new();
            tokio::time::timeout(Duration::from_secs(2), self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for frame")
                .expect("read failed");
            Frame::decode(&line).expect("decodable frame")
        }

        async fn read_response(&mut self) -> ResponseFrame {
            match self.read_frame().await {
                Frame::Response(response) => response,
                other => panic!("expected response frame, got {:?}", other),
            }
        }

        async fn read_event(&mut self) -> EventFrame {
            match self.read_frame().await {
                Frame::Event(event) => event,
                other => panic!("expected event frame, got {:?}", other),
            }
        }
    }

    fn request(service: &str, method: &str, args: Vec<Value>, request_id: u64) -> RequestFrame {
        RequestFrame {
            service_name: service.to_string(),
            method_name: method.to_string(),
            method_args: args,
            service_options: Value::Null,
            request_id,
        }
    }

    async fn start_server(dir: &tempfile::TempDir) -> (PathBuf, Arc<SubscriptionRouter>) {
        let socket_path = dir.path().join("tetherd.sock");
        let server = Server::bind(&socket_path, "0.1.0-test").await.unwrap();
        let router = server.subscription_router();
        tokio::spawn(server.run());
        (socket_path, router)
    }

    #[tokio::test]
    async fn test_heartbeat_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, _router) = start_server(&dir).await;

        let mut peer = TestPeer::connect(&socket_path, "editor-1").await;
        peer.send_request(&request("bus", "heartbeat", vec![], 1)).await;

        let response = peer.read_response().await;
        assert_eq!(response.request_id, 1);
        assert_eq!(response.result, Some(json!("0.1.0-test")));
    }

    #[tokio::test]
    async fn test_unknown_service_yields_error_response() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, _router) = start_server(&dir).await;

        let mut peer = TestPeer::connect(&socket_path, "editor-1").await;
        peer.send_request(&request("nope", "missing", vec![], 9)).await;

        let response = peer.read_response().await;
        assert_eq!(response.request_id, 9);
        assert!(response.result.is_none());
        assert!(response
            .error
            .unwrap()
            .message
            .contains("No service registered with name"));
    }

    #[tokio::test]
    async fn test_subscribe_endpoint_routes_events() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, router) = start_server(&dir).await;

        let mut peer = TestPeer::connect(&socket_path, "editor-1").await;
        peer.send_request(&request(
            "bus",
            "subscribe_event",
            vec![json!("editor-1"), json!("watcher"), json!("onChange")],
            1,
        ))
        .await;
        let response = peer.read_response().await;
        let event_name = response.result.unwrap().as_str().unwrap().to_string();
        assert_eq!(event_name, "watcher/onChange");

        router
            .publish(&event_name, vec![json!({"path": "/tmp/a"})])
            .await
            .unwrap();
        let event = peer.read_event().await;
        assert_eq!(event.event.name, "watcher/onChange");
        assert_eq!(event.event.args, vec![json!({"path": "/tmp/a"})]);
    }

    #[tokio::test]
    async fn test_unsubscribe_endpoint_stops_events() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, router) = start_server(&dir).await;

        let mut peer = TestPeer::connect(&socket_path, "editor-1").await;
        let sub_args = vec![json!("editor-1"), json!("watcher"), json!("onChange")];
        peer.send_request(&request("bus", "subscribe_event", sub_args.clone(), 1))
            .await;
        peer.read_response().await;

        peer.send_request(&request("bus", "unsubscribe_event", sub_args, 2))
            .await;
        peer.read_response().await;

        assert_eq!(router.subscriber_count("watcher/onChange"), 0);
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_block_other_requests() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("tetherd.sock");
        let server = Server::bind(&socket_path, "0.1.0-test").await.unwrap();
        let hub = server.dispatch_hub();
        hub.register(
            "/slow/wait",
            handler_fn(|_args, _options| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!("late"))
            }),
        )
        .unwrap();
        tokio::spawn(server.run());

        let mut peer = TestPeer::connect(&socket_path, "editor-1").await;
        peer.send_request(&request("slow", "wait", vec![], 1)).await;
        peer.send_request(&request("bus", "heartbeat", vec![], 2)).await;

        // The heartbeat settles while the slow call is still pending.
        let response = peer.read_response().await;
        assert_eq!(response.request_id, 2);
    }

    #[tokio::test]
    async fn test_connection_without_hello_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, _router) = start_server(&dir).await;

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut writer) = stream.into_split();
        let line = request("bus", "heartbeat", vec![], 1).to_json_line().unwrap();
        writer.write_all(line.as_bytes()).await.unwrap();

        // The server drops the connection instead of answering.
        let mut reader = BufReader::new(read_half);
        let mut buf = String::new();
        let n = tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut buf))
            .await
            .expect("timed out waiting for close")
            .expect("read failed");
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_versioned_frames_reach_installed_handler() {
        struct Recorder {
            registry: Arc<ClientRegistry>,
        }

        #[async_trait]
        impl VersionedDispatch for Recorder {
            async fn handle(&self, client_id: &ClientId, frame: Value) -> anyhow::Result<()> {
                let request_id = frame["requestId"].as_u64().unwrap_or(0);
                let reply = tether_protocol::VersionedResponseFrame::success(
                    request_id,
                    json!("versioned-ok"),
                )
                .to_json_line()?;
                self.registry.send(client_id, reply).await;
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("tetherd.sock");
        let mut server = Server::bind(&socket_path, "0.1.0-test").await.unwrap();
        let registry = server.client_registry();
        server.set_versioned_dispatch(Arc::new(Recorder { registry }));
        tokio::spawn(server.run());

        let mut peer = TestPeer::connect(&socket_path, "editor-1").await;
        let frame = json!({"protocol": "rpc-v2", "requestId": 11, "method": "ping"});
        let mut line = serde_json::to_string(&frame).unwrap();
        line.push('\n');
        peer.writer.write_all(line.as_bytes()).await.unwrap();

        match peer.read_frame().await {
            Frame::Versioned(value) => {
                assert_eq!(value["requestId"], json!(11));
                assert_eq!(value["result"], json!("versioned-ok"));
                assert_eq!(value["hadError"], json!(false));
            }
            other => panic!("expected versioned frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reconnect_receives_events_missed_while_down() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, router) = start_server(&dir).await;

        let mut peer = TestPeer::connect(&socket_path, "editor-1").await;
        peer.send_request(&request(
            "bus",
            "subscribe_event",
            vec![json!("editor-1"), json!("watcher"), json!("onChange")],
            1,
        ))
        .await;
        peer.read_response().await;

        // Drop the socket; the subscription and queue survive.
        drop(peer);
        tokio::time::sleep(Duration::from_millis(100)).await;

        router.publish("watcher/onChange", vec![json!(1)]).await.unwrap();

        let mut peer = TestPeer::connect(&socket_path, "editor-1").await;
        let event = peer.read_event().await;
        assert_eq!(event.event.args, vec![json!(1)]);
    }
}
