//! # Pulse Core
//!
//! The dispatch engine of the Pulse WebSocket load harness.
//!
//! This crate holds everything that decides what a connection does with a
//! message, independent of how connections are opened or scheduled:
//!
//! - **Rule Matcher**: path/value activation conditions ([`ActivationRule`], [`matches`])
//! - **Handlers**: rules bound to actions ([`Handler`], [`HandlerSet`], [`on`])
//! - **Replies**: what an action sends back ([`Reply`], [`IntoReply`])
//! - **Connection State**: private per-connection data ([`ConnectionState`])
//! - **Transport Abstraction**: what a worker needs from a socket ([`Connector`], [`ConnectionHandle`])
//!
//! ## Message Flow
//!
//! ```text
//! ┌───────────┐  frame  ┌────────────┐  first match  ┌──────────┐  reply  ┌───────────┐
//! │ Transport │────────▶│ HandlerSet │──────────────▶│  Action  │────────▶│ Transport │
//! └───────────┘         └────────────┘               └──────────┘         └───────────┘
//!                                                          │
//!                                                  ConnectionState
//! ```

pub mod error;
pub mod handler;
pub mod rule;
pub mod state;
pub mod transport;

pub use error::{
    DecodeError, HandlerError, HandlerResult, RuleError, RuleResult, TransportError,
    TransportResult,
};
pub use handler::{BoxFuture, Handler, HandlerBuilder, HandlerSet, IntoReply, Message, Reply, on};
pub use rule::{ActivationRule, matches, validate_message};
pub use state::{ConnectionState, StateFactory};
pub use transport::{BoxedConnector, Connection, ConnectionHandle, Connector, InboundFrames};
