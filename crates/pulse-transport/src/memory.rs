//! In-process loopback transport.
//!
//! [`MemoryConnector`] hands out connections whose server side is a
//! [`MemoryPeer`] obtained from the paired [`MemoryListener`]. It behaves like
//! the WebSocket connector as far as a worker can tell (frames in, frames out,
//! close), which makes it the transport of choice for simulations and tests.
//!
//! ```rust,ignore
//! let (connector, mut listener) = MemoryConnector::new();
//! let connector = connector.refuse_attempts([2]);
//!
//! // ... start a pool with `connector` ...
//!
//! while let Some(mut peer) = listener.accept().await {
//!     peer.send_json(&json!({ "type": "ping" })).await;
//!     assert_eq!(peer.recv_json().await, Some(json!({ "type": "pong" })));
//! }
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use pulse_core::{Connection, ConnectionHandle, Connector, TransportError, TransportResult};

type Frame = TransportResult<Vec<u8>>;

const DEFAULT_CAPACITY: usize = 64;

/// Client side of the loopback transport.
#[derive(Debug)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    attempts: AtomicUsize,
    refused: Mutex<HashSet<usize>>,
    capacity: usize,
}

impl MemoryConnector {
    /// Creates a connector and the listener receiving its connections.
    pub fn new() -> (Self, MemoryListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let connector = Self {
            accept_tx,
            attempts: AtomicUsize::new(0),
            refused: Mutex::new(HashSet::new()),
            capacity: DEFAULT_CAPACITY,
        };
        (connector, MemoryListener { accept_rx })
    }

    /// Makes the given connection attempts (0-based, in call order) fail.
    pub fn refuse_attempts(self, attempts: impl IntoIterator<Item = usize>) -> Self {
        self.refused.lock().extend(attempts);
        self
    }

    /// Number of `connect` calls so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> TransportResult<Connection> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refused.lock().contains(&attempt) {
            debug!(attempt, url = %url, "Refusing memory connection");
            return Err(TransportError::ConnectionFailed {
                url: url.to_string(),
                reason: "connection refused".into(),
            });
        }

        let (message_tx, message_rx) = mpsc::channel(self.capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (to_client, peer_rx) = mpsc::channel(self.capacity);
        let (peer_tx, from_client) = mpsc::channel(self.capacity);

        let peer = MemoryPeer {
            attempt,
            to_client,
            from_client,
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| TransportError::ConnectionFailed {
                url: url.to_string(),
                reason: "listener dropped".into(),
            })?;

        let id = format!("mem-{attempt}");
        tokio::spawn(relay(id.clone(), message_rx, shutdown_rx, peer_rx, inbound_tx, peer_tx));

        Ok(Connection {
            handle: ConnectionHandle::new(id, message_tx, shutdown_tx),
            inbound: inbound_rx,
        })
    }
}

/// Moves frames between a client handle and its peer until either side
/// goes away.
async fn relay(
    id: String,
    mut message_rx: mpsc::Receiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut peer_rx: mpsc::Receiver<Frame>,
    inbound_tx: mpsc::Sender<Frame>,
    peer_tx: mpsc::Sender<String>,
) {
    loop {
        tokio::select! {
            biased;

            Some(text) = message_rx.recv() => {
                trace!(conn = %id, len = text.len(), "Relaying to peer");
                let _ = peer_tx.send(text).await;
            }

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            frame = peer_rx.recv() => {
                let Some(frame) = frame else { break };
                let failed = frame.is_err();
                if inbound_tx.send(frame).await.is_err() || failed {
                    break;
                }
            }
        }
    }
    debug!(conn = %id, "Memory connection closed");
}

/// Receives the server side of each memory connection.
#[derive(Debug)]
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryListener {
    /// Waits for the next connection. Returns `None` once the connector is
    /// dropped and every pending connection was accepted.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }
}

/// Server side of one memory connection.
///
/// Dropping the peer closes the connection from the server side.
#[derive(Debug)]
pub struct MemoryPeer {
    /// Connection attempt this peer belongs to.
    pub attempt: usize,
    to_client: mpsc::Sender<Frame>,
    from_client: mpsc::Receiver<String>,
}

impl MemoryPeer {
    /// Sends a text frame. Returns false if the client is gone.
    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        let text: String = text.into();
        self.send_bytes(text.into_bytes()).await
    }

    /// Sends a JSON frame. Returns false if the client is gone.
    pub async fn send_json(&self, value: &Value) -> bool {
        self.send_text(value.to_string()).await
    }

    /// Sends a raw frame. Returns false if the client is gone.
    pub async fn send_bytes(&self, bytes: Vec<u8>) -> bool {
        self.to_client.send(Ok(bytes)).await.is_ok()
    }

    /// Breaks the connection with a transport error.
    pub async fn fail(self, reason: impl Into<String>) {
        let _ = self
            .to_client
            .send(Err(TransportError::Protocol(reason.into())))
            .await;
    }

    /// Receives the next frame sent by the client, or `None` once the client
    /// has closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Receives the next frame and parses it as JSON.
    pub async fn recv_json(&mut self) -> Option<Value> {
        let text = self.recv().await?;
        serde_json::from_str(&text).ok()
    }
}
