//! # Connection Manager
//!
//! Owns every live subscriber connection and the two shared queues around
//! them:
//!
//! 1.  **Fan-in**: each connection runs a reader (wire → per-connection inbound
//!     queue) and a forwarder (inbound queue → shared read channel, tagged with
//!     the subscriber id). The owner consumes everything from one
//!     [`ConnectionManager::read_channel`].
//!
//! 2.  **Fan-out**: one dispatch loop drains the owner's write channel and, for
//!     each [`OutboundFrame`], looks up the target connection under the registry
//!     lock and `try_send`s into its outbound queue. A full queue or an unknown
//!     subscriber drops the frame with a warning; the dispatch loop never
//!     blocks on a slow subscriber. Delivery is best-effort, at most once.
//!
//! 3.  **Shutdown**: a one-shot sequence. Cancel the shared token, close and
//!     deregister every connection under the lock, join every spawned task
//!     (readers, writers, forwarders, dispatcher), and only then close the read
//!     channel so no forwarder can ever send into a closed queue.
//!
//! The manager is transport-agnostic: a connection is any `Stream` of inbound
//! payloads plus any `Sink` of outbound payloads. The axum adapter in
//! `connections::axum_ws` plugs WebSocket sockets in.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{pin_mut, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::core::error::{PipelineError, Result};

/// Upper bound on flushing a close to a transport during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A frame received from a subscriber, tagged with who sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Raw payload.
    pub payload: Vec<u8>,
    /// Identity of the sending connection.
    pub producer_id: Uuid,
}

/// A frame addressed to one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Raw payload.
    pub payload: Vec<u8>,
    /// Identity of the receiving connection.
    pub consumer_id: Uuid,
}

/// Queue sizes for a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
    /// Per-connection outbound queue. Frames beyond it are dropped.
    pub outbound_capacity: usize,
    /// Per-connection inbound queue between reader and forwarder.
    pub inbound_capacity: usize,
    /// Shared read channel capacity.
    pub read_capacity: usize,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            inbound_capacity: 64,
            read_capacity: 1024,
        }
    }
}

/// Delivery counters of the dispatch loop.
#[derive(Debug, Default)]
struct DeliveryStats {
    delivered: AtomicU64,
    dropped_full: AtomicU64,
    dropped_unknown: AtomicU64,
    dropped_closed: AtomicU64,
}

/// A point-in-time copy of the dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySnapshot {
    /// Frames accepted by a connection's outbound queue.
    pub delivered: u64,
    /// Frames dropped because the outbound queue was full.
    pub dropped_full: u64,
    /// Frames dropped because no connection had the target identity.
    pub dropped_unknown: u64,
    /// Frames dropped because the target connection was closing.
    pub dropped_closed: u64,
}

impl DeliverySnapshot {
    /// Every frame the dispatch loop has seen.
    pub fn total(&self) -> u64 {
        self.delivered + self.dropped_full + self.dropped_unknown + self.dropped_closed
    }
}

/// Registry entry for one active connection.
struct ClientHandle {
    /// Distinguishes a reconnect under the same identity.
    seq: u64,
    outbound: mpsc::Sender<Vec<u8>>,
    /// Cancelling it closes the transport and ends all three connection tasks.
    close: CancellationToken,
}

type Clients = Arc<Mutex<HashMap<Uuid, ClientHandle>>>;

/// Multiplexes many subscriber connections into one read channel and routes
/// outbound frames back by identity.
pub struct ConnectionManager {
    config: ConnectionManagerConfig,
    clients: Clients,
    next_seq: AtomicU64,
    read_tx: Mutex<Option<mpsc::Sender<InboundFrame>>>,
    read_rx: Mutex<Option<mpsc::Receiver<InboundFrame>>>,
    write_rx: Mutex<Option<mpsc::Receiver<OutboundFrame>>>,
    stats: Arc<DeliveryStats>,
    token: CancellationToken,
    tracker: TaskTracker,
    shutdown_once: OnceCell<()>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(ConnectionManagerConfig::default())
    }
}

impl ConnectionManager {
    /// Creates a manager with no connections.
    pub fn new(config: ConnectionManagerConfig) -> Self {
        let (read_tx, read_rx) = mpsc::channel(config.read_capacity.max(1));
        Self {
            config,
            clients: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(1),
            read_tx: Mutex::new(Some(read_tx)),
            read_rx: Mutex::new(Some(read_rx)),
            write_rx: Mutex::new(None),
            stats: Arc::new(DeliveryStats::default()),
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            shutdown_once: OnceCell::new(),
        }
    }

    /// Hands over the shared read channel. `None` after the first call.
    pub fn read_channel(&self) -> Option<mpsc::Receiver<InboundFrame>> {
        self.read_rx.lock().expect("Read channel lock poisoned").take()
    }

    /// Supplies the channel the dispatch loop will drain.
    pub fn with_write_channel(&self, write: mpsc::Receiver<OutboundFrame>) {
        *self.write_rx.lock().expect("Write channel lock poisoned") = Some(write);
    }

    /// Starts the outbound dispatch loop on the channel given to
    /// [`ConnectionManager::with_write_channel`].
    pub fn start_write(&self) -> Result<()> {
        let mut write = self
            .write_rx
            .lock()
            .expect("Write channel lock poisoned")
            .take()
            .ok_or(PipelineError::ResourceClosed("write channel"))?;

        // Same lock as shutdown, so the loop is either tracked or refused.
        let _clients = self.clients.lock().expect("Connection registry lock poisoned");
        if self.token.is_cancelled() {
            return Err(PipelineError::ResourceClosed("connection manager"));
        }

        let clients = Arc::clone(&self.clients);
        let stats = Arc::clone(&self.stats);
        let token = self.token.clone();
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    frame = write.recv() => match frame {
                        Some(frame) => route(&clients, &stats, frame),
                        None => break,
                    },
                }
            }
            log::debug!("Outbound dispatch loop exited");
        });
        Ok(())
    }

    /// Registers a connection whose identity has been resolved and starts its
    /// reader, writer and forwarder tasks.
    ///
    /// An existing connection under the same identity is closed and replaced.
    pub fn attach<R, W, E>(&self, id: Uuid, reader: R, writer: W) -> Result<()>
    where
        R: Stream<Item = std::result::Result<Vec<u8>, E>> + Send + 'static,
        E: Display + Send + 'static,
        W: Sink<Vec<u8>> + Send + 'static,
        W::Error: Display + Send,
    {
        let read_tx = self
            .read_tx
            .lock()
            .expect("Read channel lock poisoned")
            .clone()
            .ok_or(PipelineError::ResourceClosed("connection manager"))?;

        let (out_tx, out_rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let (in_tx, in_rx) = mpsc::channel(self.config.inbound_capacity.max(1));
        let close = self.token.child_token();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let mut clients = self.clients.lock().expect("Connection registry lock poisoned");
        if self.token.is_cancelled() {
            return Err(PipelineError::ResourceClosed("connection manager"));
        }
        let handle = ClientHandle {
            seq,
            outbound: out_tx,
            close: close.clone(),
        };
        if let Some(previous) = clients.insert(id, handle) {
            log::warn!("Connection '{}' replaced by a newer session", id);
            previous.close.cancel();
        }
        log::info!("Connection '{}' active ({} live)", id, clients.len());

        self.tracker.spawn(read_loop(id, seq, reader, in_tx, close.clone(), Arc::clone(&self.clients)));
        self.tracker.spawn(write_loop(id, writer, out_rx, close));
        self.tracker.spawn(forward_loop(id, in_rx, read_tx, self.token.clone()));
        Ok(())
    }

    /// Closes and deregisters one connection. Unknown identities are ignored.
    pub fn disconnect(&self, id: &Uuid) {
        let mut clients = self.clients.lock().expect("Connection registry lock poisoned");
        if let Some(handle) = clients.remove(id) {
            handle.close.cancel();
            log::info!("Connection '{}' explicitly removed.", id);
        }
    }

    /// Whether `id` currently has an active connection.
    pub fn is_connected(&self, id: &Uuid) -> bool {
        self.clients
            .lock()
            .expect("Connection registry lock poisoned")
            .contains_key(id)
    }

    /// Number of active connections.
    pub fn connection_count(&self) -> usize {
        self.clients.lock().expect("Connection registry lock poisoned").len()
    }

    /// Dispatch counters so far.
    pub fn delivery_stats(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            dropped_full: self.stats.dropped_full.load(Ordering::Relaxed),
            dropped_unknown: self.stats.dropped_unknown.load(Ordering::Relaxed),
            dropped_closed: self.stats.dropped_closed.load(Ordering::Relaxed),
        }
    }

    /// True once shutdown has started.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Closes every connection, joins every task, then closes the read channel.
    ///
    /// Runs once. Concurrent and later callers wait for that single run to
    /// finish.
    pub async fn shutdown(&self) {
        self.shutdown_once
            .get_or_init(|| async {
                self.token.cancel();
                {
                    let mut clients = self.clients.lock().expect("Connection registry lock poisoned");
                    log::info!("Closing {} connections", clients.len());
                    for (_, handle) in clients.drain() {
                        handle.close.cancel();
                    }
                }

                self.tracker.close();
                self.tracker.wait().await;

                self.read_tx.lock().expect("Read channel lock poisoned").take();
                log::info!("Connection manager shut down");
            })
            .await;
    }
}

fn route(clients: &Clients, stats: &DeliveryStats, frame: OutboundFrame) {
    let clients = clients.lock().expect("Connection registry lock poisoned");
    let Some(client) = clients.get(&frame.consumer_id) else {
        log::warn!("Client not found for message: {}", frame.consumer_id);
        stats.dropped_unknown.fetch_add(1, Ordering::Relaxed);
        return;
    };
    match client.outbound.try_send(frame.payload) {
        Ok(()) => {
            stats.delivered.fetch_add(1, Ordering::Relaxed);
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            log::warn!("Client outbound channel full: {}", frame.consumer_id);
            stats.dropped_full.fetch_add(1, Ordering::Relaxed);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            log::warn!("Client outbound channel closed: {}", frame.consumer_id);
            stats.dropped_closed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn read_loop<R, E>(
    id: Uuid,
    seq: u64,
    reader: R,
    inbound: mpsc::Sender<Vec<u8>>,
    close: CancellationToken,
    clients: Clients,
) where
    R: Stream<Item = std::result::Result<Vec<u8>, E>>,
    E: Display,
{
    pin_mut!(reader);
    loop {
        tokio::select! {
            _ = close.cancelled() => break,
            frame = reader.next() => match frame {
                Some(Ok(payload)) => {
                    tokio::select! {
                        _ = close.cancelled() => break,
                        sent = inbound.send(payload) => if sent.is_err() { break },
                    }
                }
                Some(Err(e)) => {
                    log::warn!("Connection '{}' read error: {}", id, e);
                    break;
                }
                None => {
                    log::info!("Connection '{}' closed by peer", id);
                    break;
                }
            },
        }
    }
    drop(inbound);

    // Deregister and close together, unless shutdown or a newer session got here first.
    let mut clients = clients.lock().expect("Connection registry lock poisoned");
    if clients.get(&id).is_some_and(|c| c.seq == seq) {
        clients.remove(&id);
        log::info!("Connection '{}' deregistered ({} live)", id, clients.len());
    }
    close.cancel();
}

async fn write_loop<W>(id: Uuid, writer: W, mut outbound: mpsc::Receiver<Vec<u8>>, close: CancellationToken)
where
    W: Sink<Vec<u8>>,
    W::Error: Display,
{
    pin_mut!(writer);
    loop {
        tokio::select! {
            _ = close.cancelled() => break,
            payload = outbound.recv() => {
                let Some(payload) = payload else { break };
                tokio::select! {
                    _ = close.cancelled() => break,
                    sent = writer.send(payload) => if let Err(e) = sent {
                        log::warn!("Connection '{}' write error: {}", id, e);
                        close.cancel();
                        break;
                    },
                }
            }
        }
    }
    if tokio::time::timeout(CLOSE_TIMEOUT, writer.close()).await.is_err() {
        log::debug!("Connection '{}' close did not flush in time", id);
    }
}

async fn forward_loop(
    id: Uuid,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    read: mpsc::Sender<InboundFrame>,
    token: CancellationToken,
) {
    while let Some(payload) = inbound.recv().await {
        let frame = InboundFrame {
            payload,
            producer_id: id,
        };
        tokio::select! {
            _ = token.cancelled() => break,
            sent = read.send(frame) => if sent.is_err() { break },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_channel::mpsc as fmpsc;
    use std::convert::Infallible;

    type ClientTx = fmpsc::UnboundedSender<std::result::Result<Vec<u8>, Infallible>>;

    /// Attaches an in-memory connection. Returns the peer's sending half and
    /// the stream of frames written to the peer.
    fn connect(manager: &ConnectionManager, id: Uuid) -> (ClientTx, fmpsc::UnboundedReceiver<Vec<u8>>) {
        let (client_tx, server_rx) = fmpsc::unbounded();
        let (server_tx, client_rx) = fmpsc::unbounded::<Vec<u8>>();
        manager.attach(id, server_rx, server_tx).unwrap();
        (client_tx, client_rx)
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn routes_only_to_the_addressed_connection() {
        let manager = ConnectionManager::default();
        let (write_tx, write_rx) = mpsc::channel(16);
        manager.with_write_channel(write_rx);
        manager.start_write().unwrap();

        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (_a_tx, mut a_rx) = connect(&manager, a);
        let (_b_tx, mut b_rx) = connect(&manager, b);

        for payload in [b"one".to_vec(), b"two".to_vec()] {
            write_tx
                .send(OutboundFrame { payload, consumer_id: a })
                .await
                .unwrap();
        }

        assert_eq!(a_rx.next().await.unwrap(), b"one".to_vec());
        assert_eq!(a_rx.next().await.unwrap(), b"two".to_vec());
        assert!(b_rx.try_next().is_err());

        manager.shutdown().await;
        assert!(b_rx.next().await.is_none());
    }

    #[tokio::test]
    async fn inbound_frames_are_tagged_and_ordered() {
        let manager = ConnectionManager::default();
        let mut read = manager.read_channel().unwrap();
        assert!(manager.read_channel().is_none());

        let id = Uuid::new_v4();
        let (tx, _rx) = connect(&manager, id);
        for i in 0..5u8 {
            tx.unbounded_send(Ok(vec![i])).unwrap();
        }
        for i in 0..5u8 {
            let frame = read.recv().await.unwrap();
            assert_eq!(frame.producer_id, id);
            assert_eq!(frame.payload, vec![i]);
        }
        manager.shutdown().await;
        assert!(read.recv().await.is_none());
    }

    #[tokio::test]
    async fn unknown_identity_is_dropped_silently() {
        let manager = ConnectionManager::default();
        let (write_tx, write_rx) = mpsc::channel(4);
        manager.with_write_channel(write_rx);
        manager.start_write().unwrap();

        write_tx
            .send(OutboundFrame { payload: b"lost".to_vec(), consumer_id: Uuid::new_v4() })
            .await
            .unwrap();

        assert!(eventually(|| manager.delivery_stats().dropped_unknown == 1).await);
        assert_eq!(manager.delivery_stats().delivered, 0);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn saturated_connection_drops_without_blocking() {
        let manager = ConnectionManager::new(ConnectionManagerConfig {
            outbound_capacity: 2,
            ..Default::default()
        });
        let (write_tx, write_rx) = mpsc::channel(64);
        manager.with_write_channel(write_rx);
        manager.start_write().unwrap();

        // A peer that never reads: the bounded sink stalls after its buffer.
        let id = Uuid::new_v4();
        let (_client_tx, server_rx) = fmpsc::unbounded::<std::result::Result<Vec<u8>, Infallible>>();
        let (server_tx, _never_read) = fmpsc::channel::<Vec<u8>>(0);
        manager.attach(id, server_rx, server_tx).unwrap();

        for i in 0..20u8 {
            write_tx
                .send(OutboundFrame { payload: vec![i], consumer_id: id })
                .await
                .unwrap();
        }

        assert!(eventually(|| manager.delivery_stats().total() == 20).await);
        let stats = manager.delivery_stats();
        assert!(stats.dropped_full > 0);
        assert!(stats.delivered < 20);

        tokio::time::timeout(Duration::from_secs(5), manager.shutdown())
            .await
            .expect("shutdown blocked on a stalled connection");
    }

    #[tokio::test]
    async fn peer_close_deregisters_the_connection() {
        let manager = ConnectionManager::default();
        let id = Uuid::new_v4();
        let (tx, mut rx) = connect(&manager, id);
        assert!(manager.is_connected(&id));

        drop(tx);
        assert!(eventually(|| !manager.is_connected(&id)).await);
        assert!(rx.next().await.is_none());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn reconnect_replaces_previous_session() {
        let manager = ConnectionManager::default();
        let id = Uuid::new_v4();
        let (_old_tx, mut old_rx) = connect(&manager, id);
        let (_new_tx, _new_rx) = connect(&manager, id);

        assert!(old_rx.next().await.is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;
        // The old reader must not evict the new session.
        assert!(manager.is_connected(&id));
        assert_eq!(manager.connection_count(), 1);
        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_shutdown_closes_everything_once() {
        let manager = Arc::new(ConnectionManager::default());
        let mut read = manager.read_channel().unwrap();
        let (_write_tx, write_rx) = mpsc::channel(4);
        manager.with_write_channel(write_rx);
        manager.start_write().unwrap();

        let mut peers = Vec::new();
        for _ in 0..4 {
            peers.push(connect(&manager, Uuid::new_v4()));
        }
        assert_eq!(manager.connection_count(), 4);

        let callers: Vec<_> = (0..3)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.shutdown().await })
            })
            .collect();
        for caller in callers {
            caller.await.unwrap();
        }

        assert_eq!(manager.connection_count(), 0);
        assert!(manager.is_shutting_down());
        for (_tx, mut rx) in peers {
            assert!(rx.next().await.is_none());
        }
        assert!(read.recv().await.is_none());

        let (_tx, server_rx) = fmpsc::unbounded::<std::result::Result<Vec<u8>, Infallible>>();
        let (server_tx, _rx) = fmpsc::unbounded::<Vec<u8>>();
        assert_eq!(
            manager.attach(Uuid::new_v4(), server_rx, server_tx),
            Err(PipelineError::ResourceClosed("connection manager"))
        );
        manager.shutdown().await;
    }
}
