//! Client transport registry
//!
//! Maps each logical client id to at most one live socket plus an ordered
//! queue of frames not yet acknowledged as sent. A client record is created
//! the first time a socket identifies itself with that id and persists across
//! reconnects; frames sent while the client is disconnected are buffered and
//! flushed, each independently, when a new socket binds.
//!
//! The map lock is only ever held for lookups and insertions; socket writes
//! happen under the per-record lock, so a write parked on one client's full
//! socket buffer stalls only that client's traffic.
//!
//! Records are never destroyed: cleanup on permanent disconnect is a known
//! gap, kept until there is a robust reconnect story to distinguish the two.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Opaque identity distinguishing one logical client across reconnects of
/// its physical socket. The value is chosen by the client and carried in the
/// hello frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

struct ClientRecord {
    writer: Option<OwnedWriteHalf>,
    /// Bumped on every bind so a stale socket's close event cannot clear a
    /// newer binding.
    generation: u64,
    /// Frames awaiting transmit acknowledgement, oldest first.
    queue: VecDeque<String>,
}

impl ClientRecord {
    fn new() -> Self {
        Self {
            writer: None,
            generation: 0,
            queue: VecDeque::new(),
        }
    }
}

type SharedRecord = Arc<AsyncMutex<ClientRecord>>;

/// Registry of all client transports known to this daemon.
pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, SharedRecord>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn record(&self, client_id: &ClientId) -> Option<SharedRecord> {
        self.clients.lock().unwrap().get(client_id).cloned()
    }

    fn record_or_insert(&self, client_id: &ClientId) -> SharedRecord {
        self.clients
            .lock()
            .unwrap()
            .entry(client_id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(ClientRecord::new())))
            .clone()
    }

    /// Bind a new socket to a client id, evicting any previous socket for
    /// that id (last writer wins). Frames queued while the client was
    /// disconnected are flushed to the new socket; a flush failure leaves
    /// the frame queued for the next reconnect.
    ///
    /// Returns the binding generation, which must be passed back to
    /// [`Self::on_close`] when this socket goes away.
    pub async fn bind(&self, client_id: &ClientId, writer: OwnedWriteHalf) -> u64 {
        let record = self.record_or_insert(client_id);
        let mut record = record.lock().await;

        if let Some(mut previous) = record.writer.take() {
            info!(client = %client_id, "Evicting previous socket for reconnecting client");
            let _ = previous.shutdown().await;
        }

        record.generation += 1;
        record.writer = Some(writer);

        let queued: Vec<String> = record.queue.drain(..).collect();
        if !queued.is_empty() {
            debug!(
                client = %client_id,
                frames = queued.len(),
                "Flushing queued frames to reconnected client"
            );
        }
        for line in queued {
            Self::transmit(client_id, &mut record, line).await;
        }

        record.generation
    }

    /// Send one encoded frame to a client.
    ///
    /// The frame is enqueued unconditionally; if a socket is bound it is
    /// transmitted immediately and dequeued once the write succeeds. With no
    /// socket bound this is fire-and-forget: the frame waits for the next
    /// reconnect. Returns false when no record exists for the id.
    pub async fn send(&self, client_id: &ClientId, line: String) -> bool {
        let Some(record) = self.record(client_id) else {
            return false;
        };
        let mut record = record.lock().await;
        Self::transmit(client_id, &mut record, line).await;
        true
    }

    /// Mark a socket as gone. The queue is retained for a future reconnect.
    ///
    /// No-op if `generation` is not the current binding: a newer socket has
    /// already taken over and must not be unbound by a stale close.
    pub async fn on_close(&self, client_id: &ClientId, generation: u64) {
        let Some(record) = self.record(client_id) else {
            return;
        };
        let mut record = record.lock().await;
        if record.generation == generation {
            record.writer = None;
            debug!(client = %client_id, "Client socket closed, retaining queue");
        }
    }

    /// Whether a record exists for this id (connected or not).
    pub fn is_known(&self, client_id: &ClientId) -> bool {
        self.clients.lock().unwrap().contains_key(client_id)
    }

    /// Whether a socket is currently bound for this id.
    pub async fn is_connected(&self, client_id: &ClientId) -> bool {
        match self.record(client_id) {
            Some(record) => record.lock().await.writer.is_some(),
            None => false,
        }
    }

    /// Number of frames awaiting transmit acknowledgement for this id.
    pub async fn queued_len(&self, client_id: &ClientId) -> usize {
        match self.record(client_id) {
            Some(record) => record.lock().await.queue.len(),
            None => 0,
        }
    }

    /// Enqueue the frame, then attempt transmit if a socket is bound. The
    /// frame leaves the queue only once the write succeeds; a failed write
    /// logs a warning and leaves it queued for the next flush trigger.
    async fn transmit(client_id: &ClientId, record: &mut ClientRecord, line: String) {
        record.queue.push_back(line);
        let Some(writer) = record.writer.as_mut() else {
            return;
        };

        // The record lock is held, so the frame we just enqueued is still
        // at the back of the queue.
        let data = record.queue.back().cloned().unwrap_or_default();
        match writer.write_all(data.as_bytes()).await {
            Ok(()) => {
                record.queue.pop_back();
            }
            Err(e) => {
                warn!(
                    client = %client_id,
                    error = %e,
                    "Failed to transmit frame to client, leaving it queued"
                );
            }
        }
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::UnixStream;

    async fn read_line(peer: &mut BufReader<UnixStream>) -> String {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(1), peer.read_line(&mut line))
            .await
            .expect("timed out waiting for frame")
            .expect("read failed");
        line
    }

    #[tokio::test]
    async fn test_send_transmits_when_connected() {
        let registry = ClientRegistry::new();
        let id = ClientId::new("editor-1");

        let (local, peer) = UnixStream::pair().unwrap();
        let (_read, write) = local.into_split();
        registry.bind(&id, write).await;

        assert!(registry.send(&id, "{\"n\":1}\n".to_string()).await);
        let mut peer = BufReader::new(peer);
        assert_eq!(read_line(&mut peer).await, "{\"n\":1}\n");
        assert_eq!(registry.queued_len(&id).await, 0);
    }

    #[tokio::test]
    async fn test_send_to_unknown_client_is_rejected() {
        let registry = ClientRegistry::new();
        let id = ClientId::new("ghost");
        assert!(!registry.send(&id, "{}\n".to_string()).await);
    }

    #[tokio::test]
    async fn test_frames_queue_while_disconnected_and_flush_on_rebind() {
        let registry = ClientRegistry::new();
        let id = ClientId::new("editor-1");

        let (local_a, _peer_a) = UnixStream::pair().unwrap();
        let (_read_a, write_a) = local_a.into_split();
        let generation = registry.bind(&id, write_a).await;

        // Socket A goes away; sends while disconnected must queue.
        registry.on_close(&id, generation).await;
        assert!(!registry.is_connected(&id).await);
        assert!(registry.send(&id, "{\"n\":1}\n".to_string()).await);
        assert!(registry.send(&id, "{\"n\":2}\n".to_string()).await);
        assert_eq!(registry.queued_len(&id).await, 2);

        // Rebinding flushes the queue to the new socket.
        let (local_b, peer_b) = UnixStream::pair().unwrap();
        let (_read_b, write_b) = local_b.into_split();
        registry.bind(&id, write_b).await;

        let mut peer_b = BufReader::new(peer_b);
        assert_eq!(read_line(&mut peer_b).await, "{\"n\":1}\n");
        assert_eq!(read_line(&mut peer_b).await, "{\"n\":2}\n");
        assert_eq!(registry.queued_len(&id).await, 0);
    }

    #[tokio::test]
    async fn test_rebind_evicts_previous_socket() {
        let registry = ClientRegistry::new();
        let id = ClientId::new("editor-1");

        let (local_a, peer_a) = UnixStream::pair().unwrap();
        let (_read_a, write_a) = local_a.into_split();
        registry.bind(&id, write_a).await;

        let (local_b, peer_b) = UnixStream::pair().unwrap();
        let (_read_b, write_b) = local_b.into_split();
        registry.bind(&id, write_b).await;

        // The old socket was shut down during the rebind: its peer observes
        // end-of-stream.
        let mut peer_a = BufReader::new(peer_a);
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(1), peer_a.read_line(&mut line))
            .await
            .expect("timed out probing evicted socket")
            .expect("read failed");
        assert_eq!(n, 0, "evicted socket should be closed");

        // The new socket is live.
        assert!(registry.send(&id, "{\"n\":3}\n".to_string()).await);
        let mut peer_b = BufReader::new(peer_b);
        assert_eq!(read_line(&mut peer_b).await, "{\"n\":3}\n");
    }

    #[tokio::test]
    async fn test_stale_close_does_not_unbind_newer_socket() {
        let registry = ClientRegistry::new();
        let id = ClientId::new("editor-1");

        let (local_a, _peer_a) = UnixStream::pair().unwrap();
        let (_read_a, write_a) = local_a.into_split();
        let generation_a = registry.bind(&id, write_a).await;

        let (local_b, peer_b) = UnixStream::pair().unwrap();
        let (_read_b, write_b) = local_b.into_split();
        registry.bind(&id, write_b).await;

        // Socket A's close event arrives after B took over; it must not
        // clear B's binding.
        registry.on_close(&id, generation_a).await;
        assert!(registry.is_connected(&id).await);

        assert!(registry.send(&id, "{\"n\":4}\n".to_string()).await);
        let mut peer_b = BufReader::new(peer_b);
        assert_eq!(read_line(&mut peer_b).await, "{\"n\":4}\n");
    }

    #[tokio::test]
    async fn test_failed_transmit_leaves_frame_queued() {
        let registry = ClientRegistry::new();
        let id = ClientId::new("editor-1");

        let (local, peer) = UnixStream::pair().unwrap();
        let (_read, write) = local.into_split();
        registry.bind(&id, write).await;

        // Kill the peer so the next write fails with a broken pipe.
        drop(peer);
        tokio::task::yield_now().await;

        assert!(registry.send(&id, "{\"n\":5}\n".to_string()).await);
        assert_eq!(registry.queued_len(&id).await, 1);
    }

    #[tokio::test]
    async fn test_record_persists_after_close() {
        let registry = ClientRegistry::new();
        let id = ClientId::new("editor-1");

        let (local, _peer) = UnixStream::pair().unwrap();
        let (_read, write) = local.into_split();
        let generation = registry.bind(&id, write).await;
        registry.on_close(&id, generation).await;

        assert!(registry.is_known(&id));
        assert!(!registry.is_connected(&id).await);
    }

    #[tokio::test]
    async fn test_stalled_socket_does_not_block_other_clients() {
        let registry = Arc::new(ClientRegistry::new());
        let stalled = ClientId::new("stalled");
        let healthy = ClientId::new("healthy");

        let (local_a, peer_a) = UnixStream::pair().unwrap();
        let (_read_a, write_a) = local_a.into_split();
        registry.bind(&stalled, write_a).await;

        let (local_b, peer_b) = UnixStream::pair().unwrap();
        let (_read_b, write_b) = local_b.into_split();
        registry.bind(&healthy, write_b).await;

        // The stalled peer never reads; pumping large frames at it fills
        // its socket buffer until a write parks for good.
        let big = format!("{{\"pad\":\"{}\"}}\n", "x".repeat(64 * 1024));
        let pump = {
            let registry = registry.clone();
            let stalled = stalled.clone();
            tokio::spawn(async move {
                for _ in 0..64 {
                    registry.send(&stalled, big.clone()).await;
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pump.is_finished(), "pump should be parked on the full buffer");

        // Traffic to the healthy client still flows.
        let sent = tokio::time::timeout(
            Duration::from_secs(1),
            registry.send(&healthy, "{\"n\":1}\n".to_string()),
        )
        .await
        .expect("send to healthy client stalled behind another client's socket");
        assert!(sent);
        let mut peer_b = BufReader::new(peer_b);
        assert_eq!(read_line(&mut peer_b).await, "{\"n\":1}\n");

        // Releasing the stalled peer fails the parked write and lets the
        // pump finish.
        drop(peer_a);
        let _ = tokio::time::timeout(Duration::from_secs(5), pump).await;
    }
}
