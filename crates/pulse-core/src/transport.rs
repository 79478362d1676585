//! Transport abstraction.
//!
//! A [`Connector`] opens a [`Connection`] to an endpoint. The connection is
//! split in two halves:
//!
//! - [`ConnectionHandle`]: a cheap, clonable sender used by the worker and by
//!   every action it spawns to send replies and to request a close.
//! - [`InboundFrames`]: the receiver of frames coming from the peer. The
//!   channel ending means the connection is gone; an `Err` item is an
//!   unrecoverable transport failure.
//!
//! Concrete implementations live in `pulse-transport`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::error::{TransportError, TransportResult};

/// Stream of frames received from the peer.
pub type InboundFrames = mpsc::Receiver<TransportResult<Vec<u8>>>;

/// Opens connections to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to `url`.
    async fn connect(&self, url: &str) -> TransportResult<Connection>;
}

/// Boxed connector shared by every worker of a pool.
pub type BoxedConnector = Arc<dyn Connector>;

/// An established connection.
#[derive(Debug)]
pub struct Connection {
    /// Outbound half.
    pub handle: ConnectionHandle,
    /// Inbound half.
    pub inbound: InboundFrames,
}

/// Handle to a client connection.
///
/// Provides methods to interact with the connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Identifier of this connection, for diagnostics.
    pub id: String,
    /// Sender for outgoing text frames.
    message_tx: mpsc::Sender<String>,
    /// Shutdown signal sender.
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    /// Creates a new connection handle.
    pub fn new(
        id: impl Into<String>,
        message_tx: mpsc::Sender<String>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            id: id.into(),
            message_tx,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Sends a text frame through this connection.
    pub async fn send(&self, text: String) -> TransportResult<()> {
        if *self.shutdown_tx.borrow() {
            return Err(TransportError::SendFailed("connection is closing".into()));
        }
        self.message_tx
            .send(text)
            .await
            .map_err(|_| TransportError::SendFailed("connection closed".into()))
    }

    /// Sends a JSON message.
    pub async fn send_json(&self, value: &Value) -> TransportResult<()> {
        let text = serde_json::to_string(value)
            .map_err(|e| TransportError::SendFailed(format!("JSON serialization failed: {e}")))?;
        self.send(text).await
    }

    /// Requests a graceful close.
    ///
    /// Closing twice, or closing a connection the peer already dropped, is a
    /// no-op.
    pub fn close(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Whether a close was requested or the transport has gone away.
    pub fn is_closed(&self) -> bool {
        *self.shutdown_tx.borrow() || self.message_tx.is_closed()
    }
}
