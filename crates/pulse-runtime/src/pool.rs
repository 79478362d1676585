//! Pool orchestrator.
//!
//! A [`Pool`] opens `workers` connections to one endpoint. Every worker
//! shares the same handler set and connector but gets its own state, fresh
//! from the pool's factory. Workers fail independently: a refused connection
//! or a dropped socket ends that worker only, and the pool waits for all of
//! them before returning a [`PoolReport`].
//!
//! ```rust,ignore
//! use pulse_runtime::prelude::*;
//!
//! let pool = PoolBuilder::<Game>::default()
//!     .endpoint("ws://127.0.0.1:8080")
//!     .workers(100)
//!     .duration_budget(Duration::from_secs(60))
//!     .handler(on(["type"], "ping").reply(|_, _| json!({ "type": "pong" })))
//!     .build()?;
//!
//! let report = pool.run_until(shutdown_signal()).await;
//! println!("{} closed, {} failed", report.succeeded(), report.failed());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use pulse_core::{
    BoxFuture, BoxedConnector, ConnectionState, Connector, Handler, HandlerResult, HandlerSet,
    IntoReply, StateFactory,
};

use crate::config::{PoolConfig, validate_endpoint};
use crate::error::{RuntimeError, RuntimeResult, WorkerError};
use crate::worker::{
    ConnectionWorker, DispatchMode, OnConnect, StatsCounters, WorkerOptions, WorkerOutcome,
    WorkerStatus, panic_message,
};

/// Outcomes of every worker of a finished pool.
#[derive(Debug, Clone)]
pub struct PoolReport {
    /// One entry per worker, ordered by worker id.
    pub outcomes: Vec<WorkerOutcome>,
    /// Wall time from start to the last worker finishing.
    pub elapsed: Duration,
}

impl PoolReport {
    /// Number of workers that closed normally.
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    /// Number of workers that failed.
    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == WorkerStatus::Failed)
            .count()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// A configured set of connections, ready to run.
pub struct Pool<S> {
    endpoint: Arc<str>,
    workers: usize,
    duration_budget: Option<Duration>,
    handlers: HandlerSet<S>,
    state_factory: StateFactory<S>,
    connector: BoxedConnector,
    on_connect: Option<OnConnect<S>>,
    options: WorkerOptions,
}

impl<S: Send + 'static> Pool<S> {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Runs every worker until it closes, or until the duration budget
    /// elapses.
    pub async fn run(self) -> PoolReport {
        self.run_until(std::future::pending()).await
    }

    /// Like [`Pool::run`], but also closes every worker once `shutdown`
    /// completes.
    pub async fn run_until<F>(self, shutdown: F) -> PoolReport
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        let token = CancellationToken::new();

        let workers: Vec<ConnectionWorker<S>> = (0..self.workers)
            .map(|id| {
                ConnectionWorker::new(
                    id,
                    Arc::clone(&self.endpoint),
                    self.handlers.clone(),
                    ConnectionState::new((self.state_factory)()),
                    Arc::clone(&self.connector),
                    token.child_token(),
                )
                .with_options(self.options.clone())
                .with_on_connect(self.on_connect.clone())
            })
            .collect();

        info!(
            workers = workers.len(),
            endpoint = %self.endpoint,
            dispatch = ?self.options.dispatch,
            "Starting pool"
        );

        let mut set = JoinSet::new();
        let mut spawned: HashMap<tokio::task::Id, (usize, Arc<StatsCounters>)> = HashMap::new();
        for worker in workers {
            let meta = (worker.id(), worker.stats_handle());
            let abort = set.spawn(worker.run());
            spawned.insert(abort.id(), meta);
        }

        let deadline = async {
            match self.duration_budget {
                Some(budget) => tokio::time::sleep(budget).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);
        tokio::pin!(shutdown);

        let mut outcomes = Vec::with_capacity(self.workers);
        let mut stopping = false;
        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    Some(Ok(outcome)) => outcomes.push(outcome),
                    Some(Err(e)) => {
                        let (id, stats) = spawned
                            .remove(&e.id())
                            .map(|(id, stats)| (id, stats.snapshot()))
                            .unwrap_or_default();
                        let reason = if e.is_panic() {
                            panic_message(e.into_panic().as_ref())
                        } else {
                            e.to_string()
                        };
                        error!(worker = id, reason = %reason, "Worker task panicked");
                        outcomes.push(WorkerOutcome {
                            id,
                            status: WorkerStatus::Failed,
                            error: Some(WorkerError::Panicked(reason)),
                            stats,
                        });
                    }
                    None => break,
                },
                _ = &mut deadline, if !stopping => {
                    info!("Duration budget elapsed, closing workers");
                    token.cancel();
                    stopping = true;
                }
                _ = &mut shutdown, if !stopping => {
                    info!("Shutdown requested, closing workers");
                    token.cancel();
                    stopping = true;
                }
            }
        }

        outcomes.sort_by_key(|o| o.id);
        let report = PoolReport {
            outcomes,
            elapsed: started.elapsed(),
        };
        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Pool finished"
        );
        report
    }
}

impl<S> fmt::Debug for Pool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("endpoint", &self.endpoint)
            .field("workers", &self.workers)
            .field("duration_budget", &self.duration_budget)
            .field("handlers", &self.handlers)
            .field("options", &self.options)
            .finish()
    }
}

/// Completes on Ctrl+C; meant for [`Pool::run_until`].
///
/// If the signal handler cannot be installed this never completes.
pub async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C"),
        Err(e) => {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Pool`].
pub struct PoolBuilder<S> {
    endpoint: Option<String>,
    workers: usize,
    duration_budget: Option<Duration>,
    handlers: Vec<Handler<S>>,
    state_factory: StateFactory<S>,
    connector: Option<BoxedConnector>,
    on_connect: Option<OnConnect<S>>,
    options: WorkerOptions,
    channel_capacity: Option<usize>,
}

impl<S: Default + Send + 'static> Default for PoolBuilder<S> {
    fn default() -> Self {
        Self::new(S::default)
    }
}

impl<S: Send + 'static> PoolBuilder<S> {
    /// Starts a builder whose workers get their state from `factory`.
    pub fn new(factory: impl Fn() -> S + Send + Sync + 'static) -> Self {
        Self {
            endpoint: None,
            workers: 1,
            duration_budget: None,
            handlers: Vec::new(),
            state_factory: Arc::new(factory),
            connector: None,
            on_connect: None,
            options: WorkerOptions::default(),
            channel_capacity: None,
        }
    }

    /// Sets the `ws://` or `wss://` URL every worker connects to.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the number of concurrent connections.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Closes every worker once `budget` has elapsed.
    pub fn duration_budget(mut self, budget: Duration) -> Self {
        self.duration_budget = Some(budget);
        self
    }

    /// Appends a handler. Earlier handlers win ties.
    pub fn handler(mut self, handler: Handler<S>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Appends several handlers, in order.
    pub fn handlers(mut self, handlers: impl IntoIterator<Item = Handler<S>>) -> Self {
        self.handlers.extend(handlers);
        self
    }

    /// Sets an action run once per connection right after it opens.
    pub fn on_connect<F, Fut, R>(mut self, action: F) -> Self
    where
        F: Fn(ConnectionState<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoReply,
    {
        let action: OnConnect<S> = Arc::new(
            move |state: ConnectionState<S>| -> BoxFuture<'static, HandlerResult> {
                let fut = action(state);
                Box::pin(async move { fut.await.into_reply() })
            },
        );
        self.on_connect = Some(action);
        self
    }

    /// Sets the connector used to open connections.
    pub fn connector(self, connector: impl Connector + 'static) -> Self {
        self.shared_connector(Arc::new(connector))
    }

    /// Sets a connector that is also used elsewhere.
    pub fn shared_connector(mut self, connector: BoxedConnector) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.options.dispatch = mode;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.options.drain_timeout = timeout;
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.options.close_timeout = timeout;
        self
    }

    /// Applies every setting of a [`PoolConfig`].
    pub fn from_config(mut self, config: &PoolConfig) -> Self {
        self.endpoint = Some(config.endpoint.clone());
        self.workers = config.workers;
        self.duration_budget = config.duration_budget();
        self.options = WorkerOptions {
            dispatch: config.dispatch,
            drain_timeout: config.drain_timeout(),
            close_timeout: config.close_timeout(),
        };
        self.channel_capacity = Some(config.channel_capacity);
        self
    }

    /// Validates the settings and builds the pool.
    ///
    /// Without an explicit connector the WebSocket connector is used when the
    /// `ws-client` feature is enabled.
    pub fn build(self) -> RuntimeResult<Pool<S>> {
        let endpoint = self
            .endpoint
            .ok_or_else(|| RuntimeError::InvalidPool("no endpoint configured".into()))?;
        validate_endpoint(&endpoint)?;

        if self.workers == 0 {
            return Err(RuntimeError::InvalidPool(
                "worker count must be greater than 0".into(),
            ));
        }

        let connector = match self.connector {
            Some(connector) => connector,
            None => default_connector(self.channel_capacity, self.options.close_timeout)?,
        };

        Ok(Pool {
            endpoint: endpoint.into(),
            workers: self.workers,
            duration_budget: self.duration_budget,
            handlers: HandlerSet::new(self.handlers),
            state_factory: self.state_factory,
            connector,
            on_connect: self.on_connect,
            options: self.options,
        })
    }
}

#[cfg(feature = "ws-client")]
fn default_connector(
    channel_capacity: Option<usize>,
    close_timeout: Duration,
) -> RuntimeResult<BoxedConnector> {
    use pulse_transport::{WsClientOptions, WsConnector};

    let defaults = WsClientOptions::default();
    let options = WsClientOptions {
        channel_capacity: channel_capacity.unwrap_or(defaults.channel_capacity),
        close_timeout,
    };
    Ok(Arc::new(WsConnector::with_options(options)))
}

#[cfg(not(feature = "ws-client"))]
fn default_connector(
    _channel_capacity: Option<usize>,
    _close_timeout: Duration,
) -> RuntimeResult<BoxedConnector> {
    Err(RuntimeError::InvalidPool(
        "no connector configured and the ws-client feature is disabled".into(),
    ))
}

impl<S> fmt::Debug for PoolBuilder<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("endpoint", &self.endpoint)
            .field("workers", &self.workers)
            .field("duration_budget", &self.duration_budget)
            .field("handlers", &self.handlers.len())
            .field("options", &self.options)
            .finish()
    }
}
