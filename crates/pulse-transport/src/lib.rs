//! # Pulse Transport
//!
//! Connector implementations for the Pulse WebSocket load harness.
//!
//! This crate provides concrete implementations of the [`Connector`] trait
//! defined in `pulse-core`.
//!
//! ## Features
//!
//! - `ws-client` (default): WebSocket client connector
//! - `tls`: `wss://` endpoints through native-tls
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │  pulse-runtime      │  (workers, pool)
//! ├─────────────────────┤
//! │  pulse-core         │  (Connector trait)
//! ├─────────────────────┤
//! │  pulse-transport    │  <- This crate (implementations)
//! ├─────────────────────┤
//! │  Network / memory   │
//! └─────────────────────┘
//! ```
//!
//! ## Connectors
//!
//! | Connector | Description | Use Case |
//! |-----------|-------------|----------|
//! | `WsConnector` | WebSocket client | Load a real server |
//! | `MemoryConnector` | In-process loopback | Tests and simulations |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pulse_transport::WsConnector;
//! use pulse_core::Connector;
//!
//! let connector = WsConnector::new();
//! let conn = connector.connect("ws://127.0.0.1:8080").await?;
//! conn.handle.send_json(&serde_json::json!({ "type": "hello" })).await?;
//! ```
//!
//! [`Connector`]: pulse_core::Connector

pub mod memory;

#[cfg(feature = "ws-client")]
pub mod websocket;

pub use memory::{MemoryConnector, MemoryListener, MemoryPeer};

#[cfg(feature = "ws-client")]
pub use websocket::{WsClientOptions, WsConnector};
