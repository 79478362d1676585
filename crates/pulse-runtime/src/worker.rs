//! Connection worker.
//!
//! A [`ConnectionWorker`] owns one connection and one private
//! [`ConnectionState`] for its whole life:
//!
//! ```text
//! Connecting ──▶ Active ──▶ Closing ──▶ Closed
//!     │             │
//!     └─────────────┴──────▶ Failed
//! ```
//!
//! While active it reads frames in arrival order, decodes each into JSON,
//! picks the first matching handler and dispatches it. In
//! [`DispatchMode::Concurrent`] the action is spawned and the next frame is
//! read right away, so actions from consecutive messages may overlap on the
//! same state. [`DispatchMode::Serialized`] awaits each action first.
//!
//! Handler failures and panics are contained at the dispatch boundary: they
//! are logged and counted, and the connection keeps going.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use pulse_core::{
    BoxFuture, BoxedConnector, Connection, ConnectionHandle, ConnectionState, DecodeError,
    HandlerError, HandlerResult, HandlerSet, InboundFrames, Message,
};

use crate::error::WorkerError;

/// Action run once right after a worker connects.
pub type OnConnect<S> =
    Arc<dyn Fn(ConnectionState<S>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// How a worker runs matched actions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Spawn each action and keep reading; actions may overlap.
    #[default]
    Concurrent,
    /// Finish each action before reading the next frame.
    Serialized,
}

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Connecting,
    Active,
    Closing,
    Closed,
    Failed,
}

impl WorkerStatus {
    /// Whether the worker has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tunables shared by every worker of a pool.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub dispatch: DispatchMode,
    /// Upper bound on waiting for in-flight actions once closing.
    pub drain_timeout: Duration,
    /// Upper bound on waiting for the transport to finish closing.
    pub close_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            dispatch: DispatchMode::default(),
            drain_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Per-worker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Frames received.
    pub received: u64,
    /// Frames that triggered a handler.
    pub dispatched: u64,
    /// Well-formed messages no handler matched.
    pub unmatched: u64,
    /// Frames that decoded to something other than a non-empty object.
    pub rejected: u64,
    /// Frames that were not valid JSON.
    pub decode_errors: u64,
    /// Actions that returned an error or panicked.
    pub action_failures: u64,
    pub replies_sent: u64,
    /// Replies lost because the connection was already gone.
    pub replies_dropped: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    received: AtomicU64,
    dispatched: AtomicU64,
    unmatched: AtomicU64,
    rejected: AtomicU64,
    decode_errors: AtomicU64,
    action_failures: AtomicU64,
    replies_sent: AtomicU64,
    replies_dropped: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl StatsCounters {
    pub(crate) fn snapshot(&self) -> WorkerStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        WorkerStats {
            received: load(&self.received),
            dispatched: load(&self.dispatched),
            unmatched: load(&self.unmatched),
            rejected: load(&self.rejected),
            decode_errors: load(&self.decode_errors),
            action_failures: load(&self.action_failures),
            replies_sent: load(&self.replies_sent),
            replies_dropped: load(&self.replies_dropped),
        }
    }
}

/// How a worker ended.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub id: usize,
    /// `Closed` or `Failed`.
    pub status: WorkerStatus,
    /// Set when `status` is `Failed`.
    pub error: Option<WorkerError>,
    pub stats: WorkerStats,
}

impl WorkerOutcome {
    /// Whether the worker closed without failing.
    pub fn is_success(&self) -> bool {
        self.status == WorkerStatus::Closed
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Everything a dispatched action needs to deliver its reply.
#[derive(Clone)]
struct Delivery {
    worker: usize,
    handle: ConnectionHandle,
    stats: Arc<StatsCounters>,
}

impl Delivery {
    /// Runs an action to completion and sends its reply, if any.
    async fn run<F>(self, handler: String, message: Option<Message>, action: F)
    where
        F: Future<Output = HandlerResult> + Send,
    {
        let result = match AssertUnwindSafe(action).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(HandlerError::Panicked(panic_message(payload.as_ref()))),
        };

        let reply = match result {
            Ok(Some(reply)) if !reply.is_empty() => reply,
            Ok(_) => {
                debug!(worker = self.worker, handler = %handler, "Handler produced no reply");
                return;
            }
            Err(e) => {
                self.fail(&handler, message.as_deref(), &e);
                return;
            }
        };

        let text = match reply.encode() {
            Ok(text) => text,
            Err(e) => {
                self.fail(&handler, message.as_deref(), &e);
                return;
            }
        };

        match self.handle.send(text).await {
            Ok(()) => {
                bump(&self.stats.replies_sent);
                trace!(worker = self.worker, handler = %handler, "Reply sent");
            }
            Err(e) => {
                bump(&self.stats.replies_dropped);
                debug!(worker = self.worker, handler = %handler, error = %e, "Reply dropped");
            }
        }
    }

    fn fail(&self, handler: &str, message: Option<&Value>, e: &HandlerError) {
        bump(&self.stats.action_failures);
        let message = message.map(Value::to_string).unwrap_or_default();
        error!(
            worker = self.worker,
            handler = %handler,
            message = %message,
            error = %e,
            "Handler failed"
        );
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Drives one connection through its lifecycle.
pub struct ConnectionWorker<S> {
    id: usize,
    endpoint: Arc<str>,
    handlers: HandlerSet<S>,
    state: ConnectionState<S>,
    connector: BoxedConnector,
    on_connect: Option<OnConnect<S>>,
    options: WorkerOptions,
    cancel: CancellationToken,
    tracker: TaskTracker,
    stats: Arc<StatsCounters>,
    status: WorkerStatus,
}

impl<S: Send + 'static> ConnectionWorker<S> {
    /// Creates a worker in the `Connecting` state.
    pub fn new(
        id: usize,
        endpoint: impl Into<Arc<str>>,
        handlers: HandlerSet<S>,
        state: ConnectionState<S>,
        connector: BoxedConnector,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
            handlers,
            state,
            connector,
            on_connect: None,
            options: WorkerOptions::default(),
            cancel,
            tracker: TaskTracker::new(),
            stats: Arc::default(),
            status: WorkerStatus::Connecting,
        }
    }

    /// Sets the worker options.
    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the action run right after connecting.
    pub fn with_on_connect(mut self, on_connect: Option<OnConnect<S>>) -> Self {
        self.on_connect = on_connect;
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    /// This worker's private state.
    pub fn state(&self) -> &ConnectionState<S> {
        &self.state
    }

    pub(crate) fn stats_handle(&self) -> Arc<StatsCounters> {
        Arc::clone(&self.stats)
    }

    fn set_status(&mut self, status: WorkerStatus) {
        debug!(worker = self.id, from = %self.status, to = %status, "Worker state change");
        self.status = status;
    }

    /// Runs the worker until the connection ends or it is cancelled.
    pub async fn run(mut self) -> WorkerOutcome {
        debug!(worker = self.id, endpoint = %self.endpoint, "Worker connecting");

        let connected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = self.connector.connect(&self.endpoint) => Some(result),
        };

        let Connection {
            handle,
            mut inbound,
        } = match connected {
            None => {
                debug!(worker = self.id, "Cancelled while connecting");
                return self.finish(WorkerStatus::Closed, None);
            }
            Some(Err(e)) => {
                warn!(worker = self.id, endpoint = %self.endpoint, error = %e, "Worker failed to connect");
                return self.finish(WorkerStatus::Failed, Some(WorkerError::Transport(e)));
            }
            Some(Ok(connection)) => connection,
        };

        self.set_status(WorkerStatus::Active);
        info!(worker = self.id, conn = %handle.id, "Worker connected");

        let delivery = Delivery {
            worker: self.id,
            handle: handle.clone(),
            stats: Arc::clone(&self.stats),
        };

        let greeted = match self.on_connect.clone() {
            Some(on_connect) => {
                let state = self.state.clone();
                let action = async move { on_connect(state).await };
                self.dispatch(delivery.clone().run("on_connect".to_string(), None, action))
                    .await
            }
            None => true,
        };

        let (status, error) = if greeted {
            self.receive(&delivery, &mut inbound).await
        } else {
            debug!(worker = self.id, "Worker cancelled");
            (WorkerStatus::Closed, None)
        };

        self.set_status(WorkerStatus::Closing);
        self.shutdown(&handle, &mut inbound).await;
        self.finish(status, error)
    }

    /// Reads frames until the peer closes, the transport fails or the worker
    /// is cancelled.
    async fn receive(
        &self,
        delivery: &Delivery,
        inbound: &mut InboundFrames,
    ) -> (WorkerStatus, Option<WorkerError>) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(worker = self.id, "Worker cancelled");
                    return (WorkerStatus::Closed, None);
                }
                frame = inbound.recv() => frame,
            };

            match frame {
                Some(Ok(bytes)) => {
                    if !self.handle_frame(delivery, &bytes).await {
                        debug!(worker = self.id, "Worker cancelled during an action");
                        return (WorkerStatus::Closed, None);
                    }
                }
                Some(Err(e)) => {
                    warn!(worker = self.id, error = %e, "Transport error");
                    return (WorkerStatus::Failed, Some(WorkerError::Transport(e)));
                }
                None => {
                    info!(worker = self.id, "Connection closed by peer");
                    return (WorkerStatus::Closed, None);
                }
            }
        }
    }

    /// Decodes one frame and dispatches the first matching handler.
    ///
    /// Returns false when cancellation interrupted the dispatched action.
    async fn handle_frame(&self, delivery: &Delivery, bytes: &[u8]) -> bool {
        bump(&self.stats.received);
        trace!(worker = self.id, len = bytes.len(), "Frame received");

        let value: Value = match serde_json::from_slice(bytes) {
            Ok(value) => value,
            Err(source) => {
                bump(&self.stats.decode_errors);
                let e = DecodeError {
                    len: bytes.len(),
                    source,
                };
                warn!(worker = self.id, error = %e, "Dropping undecodable frame");
                return true;
            }
        };

        let handler = match self.handlers.select(&value) {
            Ok(Some(handler)) => handler.clone(),
            Ok(None) => {
                bump(&self.stats.unmatched);
                warn!(worker = self.id, message = %value, "Missing handler for message");
                return true;
            }
            Err(e) => {
                bump(&self.stats.rejected);
                warn!(worker = self.id, error = %e, "Rejected message");
                return true;
            }
        };

        bump(&self.stats.dispatched);
        debug!(worker = self.id, handler = handler.name(), "Handler triggered");

        let name = handler.name().to_owned();
        let message: Message = Arc::new(value);
        let state = self.state.clone();
        let input = Arc::clone(&message);
        // Invoked inside the future so a panic in the call itself is caught too.
        let action = async move { handler.run(input, state).await };

        self.dispatch(delivery.clone().run(name, Some(message), action))
            .await
    }

    /// Runs `task` according to the dispatch mode.
    ///
    /// Returns false when the worker was cancelled before a serialized task
    /// finished. The unfinished task moves to the tracker and is covered by
    /// the drain in [`Self::shutdown`].
    async fn dispatch<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.options.dispatch {
            DispatchMode::Concurrent => {
                self.tracker.spawn(task);
                true
            }
            DispatchMode::Serialized => {
                let mut task = Box::pin(task);
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        self.tracker.spawn(task);
                        false
                    }
                    () = &mut task => true,
                }
            }
        }
    }

    /// Drains in-flight actions, then closes the connection.
    async fn shutdown(&self, handle: &ConnectionHandle, inbound: &mut InboundFrames) {
        self.tracker.close();
        if !self.tracker.is_empty() {
            debug!(worker = self.id, pending = self.tracker.len(), "Draining in-flight actions");
        }
        if tokio::time::timeout(self.options.drain_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                worker = self.id,
                pending = self.tracker.len(),
                "Drain timed out, leaving actions behind"
            );
        }

        handle.close();
        let drained = tokio::time::timeout(self.options.close_timeout, async {
            while inbound.recv().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            debug!(worker = self.id, "Transport did not finish closing in time");
        }
    }

    fn finish(mut self, status: WorkerStatus, error: Option<WorkerError>) -> WorkerOutcome {
        self.set_status(status);
        let stats = self.stats.snapshot();
        match &error {
            Some(e) => info!(worker = self.id, status = %status, error = %e, "Worker finished"),
            None => info!(
                worker = self.id,
                status = %status,
                received = stats.received,
                replies = stats.replies_sent,
                "Worker finished"
            ),
        }
        WorkerOutcome {
            id: self.id,
            status,
            error,
            stats,
        }
    }
}

impl<S> fmt::Debug for ConnectionWorker<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionWorker")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("status", &self.status)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pulse_core::{
        Connector, Handler, HandlerError, TransportError, TransportResult, on,
    };
    use pulse_transport::{MemoryConnector, MemoryListener, MemoryPeer};
    use serde_json::json;

    fn ping() -> Handler<()> {
        on(["type"], "ping").reply(|_, _| json!({"type": "pong"}))
    }

    fn worker<S: Send + 'static>(
        handlers: Vec<Handler<S>>,
        state: S,
    ) -> (ConnectionWorker<S>, MemoryListener, CancellationToken) {
        let (connector, listener) = MemoryConnector::new();
        let cancel = CancellationToken::new();
        let worker = ConnectionWorker::new(
            0,
            "ws://memory",
            HandlerSet::new(handlers),
            ConnectionState::new(state),
            Arc::new(connector),
            cancel.clone(),
        );
        (worker, listener, cancel)
    }

    async fn round_trip(peer: &mut MemoryPeer) {
        peer.send_json(&json!({"type": "ping"})).await;
        assert_eq!(peer.recv_json().await, Some(json!({"type": "pong"})));
    }

    #[tokio::test]
    async fn test_ping_pong_then_remote_close() {
        let (worker, mut listener, _cancel) = worker(vec![ping()], ());
        let run = tokio::spawn(worker.run());

        let mut peer = listener.accept().await.unwrap();
        round_trip(&mut peer).await;
        drop(peer);

        let outcome = run.await.unwrap();
        assert_eq!(outcome.status, WorkerStatus::Closed);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.stats.received, 1);
        assert_eq!(outcome.stats.dispatched, 1);
        assert_eq!(outcome.stats.replies_sent, 1);
    }

    #[tokio::test]
    async fn test_unmatched_and_bad_frames_are_skipped() {
        let (worker, mut listener, _cancel) = worker(vec![ping()], ());
        let run = tokio::spawn(worker.run());

        let mut peer = listener.accept().await.unwrap();
        peer.send_json(&json!({"type": "unknown"})).await;
        peer.send_text("not json").await;
        peer.send_text("[1, 2]").await;
        peer.send_text("{}").await;
        // Only the ping gets an answer; nothing was sent for the others.
        round_trip(&mut peer).await;
        drop(peer);

        let stats = run.await.unwrap().stats;
        assert_eq!(stats.received, 5);
        assert_eq!(stats.unmatched, 1);
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.rejected, 2);
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.replies_sent, 1);
    }

    #[tokio::test]
    async fn test_nested_rule() {
        let handler: Handler<()> = on(["data", "kind"], "x").reply(|_, _| json!({"ok": true}));
        let (worker, mut listener, _cancel) = worker(vec![handler, ping()], ());
        let run = tokio::spawn(worker.run());

        let mut peer = listener.accept().await.unwrap();
        peer.send_json(&json!({"data": {"kind": "y"}})).await;
        peer.send_json(&json!({"data": {"kind": "x"}})).await;
        assert_eq!(peer.recv_json().await, Some(json!({"ok": true})));
        drop(peer);

        let stats = run.await.unwrap().stats;
        assert_eq!(stats.unmatched, 1);
        assert_eq!(stats.replies_sent, 1);
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_are_contained() {
        let failing: Handler<()> =
            on(["type"], "fail").action(|_, _| async { Err::<(), _>(HandlerError::failed("nope")) });
        let panicking: Handler<()> = on(["type"], "boom").reply(|_, _| -> Value { panic!("boom") });
        let (worker, mut listener, _cancel) = worker(vec![failing, panicking, ping()], ());
        let run = tokio::spawn(worker.run());

        let mut peer = listener.accept().await.unwrap();
        peer.send_json(&json!({"type": "fail"})).await;
        peer.send_json(&json!({"type": "boom"})).await;
        round_trip(&mut peer).await;
        drop(peer);

        let outcome = run.await.unwrap();
        assert_eq!(outcome.status, WorkerStatus::Closed);
        assert_eq!(outcome.stats.action_failures, 2);
        assert_eq!(outcome.stats.replies_sent, 1);
    }

    #[tokio::test]
    async fn test_empty_replies_are_not_sent() {
        let handlers: Vec<Handler<()>> = vec![
            on(["type"], "null").reply(|_, _| Value::Null),
            on(["type"], "object").reply(|_, _| json!({})),
            on(["type"], "text").reply(|_, _| ""),
            on(["type"], "unit").reply(|_, _| ()),
            ping(),
        ];
        let (worker, mut listener, _cancel) = worker(handlers, ());
        let run = tokio::spawn(worker.run());

        let mut peer = listener.accept().await.unwrap();
        for kind in ["null", "object", "text", "unit"] {
            peer.send_json(&json!({"type": kind})).await;
        }
        round_trip(&mut peer).await;
        drop(peer);

        let stats = run.await.unwrap().stats;
        assert_eq!(stats.dispatched, 5);
        assert_eq!(stats.replies_sent, 1);
        assert_eq!(stats.action_failures, 0);
    }

    #[tokio::test]
    async fn test_on_connect_speaks_first() {
        let (worker, mut listener, _cancel) = worker(vec![ping()], ());
        let worker = worker
            .with_options(WorkerOptions {
                dispatch: DispatchMode::Serialized,
                ..Default::default()
            })
            .with_on_connect(Some(Arc::new(|_state: ConnectionState<()>| {
                Box::pin(async { Ok(Some(pulse_core::Reply::Json(json!({"type": "hello"})))) })
                    as BoxFuture<'static, HandlerResult>
            })));
        let run = tokio::spawn(worker.run());

        let mut peer = listener.accept().await.unwrap();
        assert_eq!(peer.recv_json().await, Some(json!({"type": "hello"})));
        round_trip(&mut peer).await;
        drop(peer);

        assert_eq!(run.await.unwrap().stats.replies_sent, 2);
    }

    #[tokio::test]
    async fn test_cancel_closes_connection() {
        let (worker, mut listener, cancel) = worker(vec![ping()], ());
        let run = tokio::spawn(worker.run());

        let mut peer = listener.accept().await.unwrap();
        round_trip(&mut peer).await;
        cancel.cancel();

        // The worker closes its side; the peer sees the end of the stream.
        assert_eq!(peer.recv().await, None);
        let outcome = run.await.unwrap();
        assert_eq!(outcome.status, WorkerStatus::Closed);
    }

    #[tokio::test]
    async fn test_transport_error_fails_worker() {
        let (worker, mut listener, _cancel) = worker(vec![ping()], ());
        let run = tokio::spawn(worker.run());

        listener.accept().await.unwrap().fail("connection reset").await;

        let outcome = run.await.unwrap();
        assert_eq!(outcome.status, WorkerStatus::Failed);
        assert!(matches!(
            outcome.error,
            Some(WorkerError::Transport(TransportError::Protocol(_)))
        ));
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let (connector, _listener) = MemoryConnector::new();
        let worker = ConnectionWorker::new(
            3,
            "ws://memory",
            HandlerSet::new(vec![ping()]),
            ConnectionState::new(()),
            Arc::new(connector.refuse_attempts([0])),
            CancellationToken::new(),
        );

        let outcome = worker.run().await;
        assert_eq!(outcome.id, 3);
        assert_eq!(outcome.status, WorkerStatus::Failed);
        assert!(matches!(
            outcome.error,
            Some(WorkerError::Transport(TransportError::ConnectionFailed { .. }))
        ));
        assert_eq!(outcome.stats, WorkerStats::default());
    }

    struct NeverConnects;

    #[async_trait]
    impl Connector for NeverConnects {
        async fn connect(&self, _url: &str) -> TransportResult<Connection> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancel_while_connecting() {
        let cancel = CancellationToken::new();
        let worker = ConnectionWorker::new(
            0,
            "ws://nowhere",
            HandlerSet::new(vec![ping()]),
            ConnectionState::new(()),
            Arc::new(NeverConnects),
            cancel.clone(),
        );
        assert_eq!(worker.status(), WorkerStatus::Connecting);

        let run = tokio::spawn(worker.run());
        cancel.cancel();

        let outcome = run.await.unwrap();
        assert_eq!(outcome.status, WorkerStatus::Closed);
        assert!(outcome.error.is_none());
    }

    // Two messages whose actions take different times and share one state.

    #[derive(Debug, Default)]
    struct Overlap {
        in_flight: usize,
        max_in_flight: usize,
        log: Vec<String>,
    }

    fn timed(kind: &'static str, millis: u64) -> Handler<Overlap> {
        on(["type"], kind).action(move |_, state: ConnectionState<Overlap>| async move {
            state.with(|s| {
                s.in_flight += 1;
                s.max_in_flight = s.max_in_flight.max(s.in_flight);
                s.log.push(format!("{kind}:start"));
            });
            tokio::time::sleep(Duration::from_millis(millis)).await;
            state.with(|s| {
                s.in_flight -= 1;
                s.log.push(format!("{kind}:end"));
                json!({"done": kind, "max_in_flight": s.max_in_flight, "log": s.log})
            })
        })
    }

    async fn run_overlap(dispatch: DispatchMode) -> Vec<Value> {
        let (worker, mut listener, _cancel) =
            worker(vec![timed("slow", 50), timed("fast", 10)], Overlap::default());
        let worker = worker.with_options(WorkerOptions {
            dispatch,
            ..Default::default()
        });
        let run = tokio::spawn(worker.run());

        let mut peer = listener.accept().await.unwrap();
        peer.send_json(&json!({"type": "slow"})).await;
        peer.send_json(&json!({"type": "fast"})).await;
        let replies = vec![
            peer.recv_json().await.unwrap(),
            peer.recv_json().await.unwrap(),
        ];
        drop(peer);
        run.await.unwrap();
        replies
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_dispatch_overlaps() {
        let replies = run_overlap(DispatchMode::Concurrent).await;

        let mut done: Vec<_> = replies.iter().map(|r| r["done"].clone()).collect();
        done.sort_by_key(|d| d.to_string());
        assert_eq!(done, vec![json!("fast"), json!("slow")]);

        // Whichever action finished last saw the complete log.
        let last = replies
            .iter()
            .find(|r| r["log"].as_array().is_some_and(|log| log.len() == 4))
            .unwrap();
        assert_eq!(last["max_in_flight"], 2);

        let log: Vec<&str> = last["log"]
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry.as_str().unwrap())
            .collect();
        let position = |entry: &str| log.iter().position(|e| *e == entry).unwrap();
        for kind in ["slow", "fast"] {
            assert!(position(&format!("{kind}:start")) < position(&format!("{kind}:end")));
        }
        assert!(log[..2].iter().all(|entry| entry.ends_with(":start")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_serialized_dispatch_keeps_order() {
        let replies = run_overlap(DispatchMode::Serialized).await;

        assert_eq!(replies[0]["done"], "slow");
        assert_eq!(replies[1]["done"], "fast");
        assert_eq!(replies[1]["max_in_flight"], 1);
        assert_eq!(
            replies[1]["log"],
            json!(["slow:start", "slow:end", "fast:start", "fast:end"])
        );
    }

    // An action that waits for a card that never comes.

    #[derive(Debug, Default)]
    struct Table {
        waiting: bool,
        hand: Vec<Value>,
    }

    fn stuck_turn() -> Handler<Table> {
        on(["type"], "your_turn").action(|_, state: ConnectionState<Table>| async move {
            state.with(|t| t.waiting = true);
            let card = state
                .wait_until(Duration::from_millis(10), |t| t.hand.pop())
                .await;
            json!({"type": "play", "card": card})
        })
    }

    fn short_timeouts(dispatch: DispatchMode) -> WorkerOptions {
        WorkerOptions {
            dispatch,
            drain_timeout: Duration::from_millis(100),
            close_timeout: Duration::from_millis(100),
        }
    }

    async fn cancel_mid_action(dispatch: DispatchMode) -> WorkerOutcome {
        let (worker, mut listener, cancel) = worker(vec![stuck_turn()], Table::default());
        let worker = worker.with_options(short_timeouts(dispatch));
        let state = worker.state().clone();
        let run = tokio::spawn(worker.run());

        let mut peer = listener.accept().await.unwrap();
        peer.send_json(&json!({"type": "your_turn"})).await;
        state
            .wait_until(Duration::from_millis(1), |t| t.waiting.then_some(()))
            .await;
        cancel.cancel();

        assert_eq!(peer.recv().await, None);
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap_or_else(|_| panic!("{dispatch:?} worker ignored cancellation"))
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_with_concurrent_action_in_flight() {
        let outcome = cancel_mid_action(DispatchMode::Concurrent).await;
        assert_eq!(outcome.status, WorkerStatus::Closed);
        assert_eq!(outcome.stats.dispatched, 1);
        assert_eq!(outcome.stats.replies_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_with_serialized_action_in_flight() {
        let outcome = cancel_mid_action(DispatchMode::Serialized).await;
        assert_eq!(outcome.status, WorkerStatus::Closed);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.stats.dispatched, 1);
        assert_eq!(outcome.stats.replies_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_serialized_on_connect() {
        let (worker, mut listener, cancel) = worker(vec![ping()], ());
        let worker = worker
            .with_options(short_timeouts(DispatchMode::Serialized))
            .with_on_connect(Some(Arc::new(|_state: ConnectionState<()>| {
                Box::pin(std::future::pending::<HandlerResult>())
                    as BoxFuture<'static, HandlerResult>
            })));
        let run = tokio::spawn(worker.run());

        let mut peer = listener.accept().await.unwrap();
        cancel.cancel();

        assert_eq!(peer.recv().await, None);
        let outcome = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.status, WorkerStatus::Closed);
        assert_eq!(outcome.stats.received, 0);
    }
}
