//! # Pulse
//!
//! Drive many scripted WebSocket clients against one server.
//!
//! ## Overview
//!
//! Pulse opens N connections to an endpoint. Every connection runs the same
//! list of handlers, each one a path/value rule bound to an async action,
//! against its own private state. Incoming JSON messages trigger the first
//! matching handler; whatever the action returns is sent back on the same
//! connection.
//!
//! ```text
//! ┌──────────┐     ┌──────────────────────────────────────────────┐
//! │          │────▶│ Worker 0 (own connection, own state)          │◀──▶ server
//! │   Pool   │────▶│ Worker 1 (own connection, own state)          │◀──▶ server
//! │          │────▶│ Worker ...                                    │◀──▶ server
//! └──────────┘     └──────────────────────────────────────────────┘
//!                         shared, immutable HandlerSet
//! ```
//!
//! - **Pool**: builds the workers, runs them, collects a report
//! - **Workers**: one connection each; failures never spread to siblings
//! - **Handlers**: `on(path, expected)` rules with async actions
//! - **State**: per-connection data reached through `ConnectionState::with`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pulse::prelude::*;
//! use serde_json::json;
//!
//! #[derive(Default)]
//! struct Player { hand: Vec<String> }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     LoggingBuilder::new().init();
//!
//!     let pool = PoolBuilder::<Player>::default()
//!         .endpoint("ws://127.0.0.1:8080")
//!         .workers(50)
//!         .handler(on(["type"], "ping").reply(|_, _| json!({ "type": "pong" })))
//!         .handler(on(["type"], "deal").reply(|msg: Message, state: ConnectionState<Player>| {
//!             let card = msg["card"].as_str().unwrap_or_default().to_string();
//!             state.with(|p| p.hand.push(card));
//!         }))
//!         .build()?;
//!
//!     let report = pool.run_until(shutdown_signal()).await;
//!     info!(ok = report.succeeded(), failed = report.failed(), "Done");
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `ws-client` (default): WebSocket connector
//! - `tls`: `wss://` endpoints
//! - `json-log`: JSON log output

pub use pulse_core as core;
pub use pulse_runtime as runtime;
pub use pulse_transport as transport;

pub use pulse_core::{
    ActivationRule, ConnectionState, Handler, HandlerError, HandlerSet, IntoReply, Message, Reply,
    on,
};
pub use pulse_runtime::{
    DispatchMode, Pool, PoolBuilder, PoolReport, RuntimeError, WorkerOutcome, WorkerStatus,
};

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use pulse::prelude::*;
/// ```
pub mod prelude {
    // Logging macros and setup
    pub use pulse_runtime::prelude::*;
    pub use pulse_runtime::{PulseConfig, SpanEvents};

    // Handlers and state
    pub use pulse_core::{ActivationRule, HandlerError, HandlerSet, IntoReply, matches};

    // Transports
    pub use pulse_core::Connector;
    pub use pulse_transport::MemoryConnector;
    #[cfg(feature = "ws-client")]
    pub use pulse_transport::WsConnector;
}
