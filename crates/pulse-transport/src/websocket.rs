//! WebSocket client connector.
//!
//! Each connection gets a background task that owns the socket. The task
//! forwards text and binary frames to the connection's inbound channel,
//! writes queued outbound frames, answers pings, and performs the close
//! handshake when the handle asks for it. There is no reconnect: when the
//! socket goes away the inbound channel simply ends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

use pulse_core::{Connection, ConnectionHandle, Connector, TransportError, TransportResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Options for WebSocket client connections.
#[derive(Debug, Clone)]
pub struct WsClientOptions {
    /// Capacity of the inbound and outbound frame channels.
    pub channel_capacity: usize,
    /// How long to wait for the peer to answer a close frame.
    pub close_timeout: Duration,
}

impl Default for WsClientOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// WebSocket client connector.
#[derive(Debug, Default)]
pub struct WsConnector {
    options: WsClientOptions,
    next_id: AtomicU64,
}

impl WsConnector {
    /// Creates a connector with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a connector with the given options.
    pub fn with_options(options: WsClientOptions) -> Self {
        Self {
            options,
            next_id: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> TransportResult<Connection> {
        let id = format!("ws-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let capacity = self.options.channel_capacity.max(1);

        debug!(conn = %id, url = %url, "Connecting to WebSocket server");

        let (ws_stream, _response) =
            connect_async(url)
                .await
                .map_err(|e| TransportError::ConnectionFailed {
                    url: url.to_string(),
                    reason: format!("WebSocket connection failed: {e}"),
                })?;
        let (ws_tx, ws_rx) = ws_stream.split();

        let (message_tx, message_rx) = mpsc::channel::<String>(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(conn = %id, url = %url, "WebSocket client connected");

        let state = ClientLoopState {
            id: id.clone(),
            close_timeout: self.options.close_timeout,
            ws_tx,
            ws_rx,
            inbound_tx,
        };
        tokio::spawn(state.run(message_rx, shutdown_rx));

        Ok(Connection {
            handle: ConnectionHandle::new(id, message_tx, shutdown_tx),
            inbound: inbound_rx,
        })
    }
}

/// State owned by the per-connection socket task.
struct ClientLoopState {
    id: String,
    close_timeout: Duration,
    ws_tx: WsSink,
    ws_rx: WsSource,
    inbound_tx: mpsc::Sender<TransportResult<Vec<u8>>>,
}

impl ClientLoopState {
    async fn run(
        mut self,
        mut message_rx: mpsc::Receiver<String>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            // Queued frames go out before a pending close is honoured.
            tokio::select! {
                biased;

                // Frames queued by the worker or its actions
                Some(text) = message_rx.recv() => {
                    trace!(conn = %self.id, len = text.len(), "Sending text");
                    if let Err(e) = self.ws_tx.send(Message::Text(text.into())).await {
                        warn!(conn = %self.id, error = %e, "Failed to send message");
                    }
                }

                // Check for shutdown
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        self.close().await;
                        break;
                    }
                }

                // Frames from the server
                msg = self.ws_rx.next() => {
                    if !self.handle_message(msg).await {
                        break;
                    }
                }
            }
        }

        debug!(conn = %self.id, "WebSocket client loop finished");
    }

    /// Handles one item from the socket.
    /// Returns false once the connection is over.
    async fn handle_message(&mut self, msg: Option<Result<Message, Error>>) -> bool {
        match msg {
            Some(Ok(Message::Text(text))) => {
                trace!(conn = %self.id, len = text.len(), "Received text");
                self.forward(text.as_str().as_bytes().to_vec()).await
            }
            Some(Ok(Message::Binary(data))) => {
                trace!(conn = %self.id, len = data.len(), "Received binary");
                self.forward(data.to_vec()).await
            }
            Some(Ok(Message::Ping(data))) => {
                trace!(conn = %self.id, "Received ping, sending pong");
                let _ = self.ws_tx.send(Message::Pong(data)).await;
                true
            }
            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => true,
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .as_ref()
                    .map(|f| f.reason.as_str().to_owned())
                    .unwrap_or_default();
                info!(conn = %self.id, reason = %reason, "Server closed connection");
                // Flushes the close reply tungstenite queued for us.
                let _ = self.ws_tx.flush().await;
                false
            }
            Some(Err(Error::ConnectionClosed)) | Some(Err(Error::AlreadyClosed)) => {
                info!(conn = %self.id, "WebSocket connection closed");
                false
            }
            Some(Err(e)) => {
                warn!(conn = %self.id, error = %e, "WebSocket error");
                let _ = self
                    .inbound_tx
                    .send(Err(TransportError::Protocol(e.to_string())))
                    .await;
                false
            }
            None => {
                info!(conn = %self.id, "WebSocket stream ended");
                false
            }
        }
    }

    /// Hands a frame to the worker. Returns false if nobody is listening.
    async fn forward(&mut self, frame: Vec<u8>) -> bool {
        if self.inbound_tx.send(Ok(frame)).await.is_ok() {
            return true;
        }
        debug!(conn = %self.id, "Inbound receiver dropped, closing");
        self.close().await;
        false
    }

    /// Sends a normal-closure frame and waits for the peer's answer.
    async fn close(&mut self) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: String::new().into(),
        };
        match self.ws_tx.send(Message::Close(Some(frame))).await {
            Ok(()) | Err(Error::ConnectionClosed) | Err(Error::AlreadyClosed) => {}
            Err(e) => {
                debug!(conn = %self.id, error = %e, "Failed to send close frame");
                return;
            }
        }

        let ws_rx = &mut self.ws_rx;
        let handshake = async move {
            while let Some(msg) = ws_rx.next().await {
                if matches!(msg, Ok(Message::Close(_)) | Err(_)) {
                    break;
                }
            }
        };
        if tokio::time::timeout(self.close_timeout, handshake).await.is_err() {
            debug!(conn = %self.id, "Close handshake timed out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::accept_async;

    /// Accepts one connection, sends a ping, echoes the first reply back
    /// wrapped in `{"echo": ..}`, then reads until the client goes away.
    async fn spawn_server() -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mut received = Vec::new();

            ws.send(Message::Text(r#"{"type":"ping"}"#.to_string().into()))
                .await
                .unwrap();

            while let Some(msg) = ws.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let echo = json!({ "echo": text.as_str() }).to_string();
                        received.push(text.to_string());
                        ws.send(Message::Text(echo.into())).await.unwrap();
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            received
        });

        (format!("ws://{addr}"), task)
    }

    #[tokio::test]
    async fn test_round_trip_and_graceful_close() {
        let (url, server) = spawn_server().await;
        let connector = WsConnector::new();
        let Connection { handle, mut inbound } = connector.connect(&url).await.unwrap();

        let first = inbound.recv().await.unwrap().unwrap();
        let first: Value = serde_json::from_slice(&first).unwrap();
        assert_eq!(first, json!({"type": "ping"}));

        handle.send_json(&json!({"type": "pong"})).await.unwrap();
        let echo = inbound.recv().await.unwrap().unwrap();
        let echo: Value = serde_json::from_slice(&echo).unwrap();
        assert_eq!(echo, json!({"echo": r#"{"type":"pong"}"#}));

        handle.close();
        assert!(inbound.recv().await.is_none());

        let received = server.await.unwrap();
        assert_eq!(received, vec![r#"{"type":"pong"}"#.to_string()]);
    }

    #[tokio::test]
    async fn test_server_close_ends_inbound() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.close(None).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let connector = WsConnector::new();
        let mut conn = connector.connect(&format!("ws://{addr}")).await.unwrap();
        assert!(conn.inbound.recv().await.is_none());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = WsConnector::new();
        let result = connector.connect(&format!("ws://{addr}")).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed { .. })));
    }
}
