//! Error types shared by every Pulse layer.
//!
//! Runtime-level errors (configuration, pool construction) live in
//! `pulse-runtime`; everything a connection or a handler can run into is
//! defined here.

use thiserror::Error;

// =============================================================================
// Rule Errors
// =============================================================================

/// Errors raised by the rule matcher.
///
/// These are contract violations by the caller rather than runtime
/// conditions; a missing key in a well-formed message is a plain non-match.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    /// The message was empty or not a JSON object.
    #[error("invalid input: {reason}")]
    InvalidInput {
        /// What was wrong with the message.
        reason: &'static str,
    },
}

// =============================================================================
// Decode Errors
// =============================================================================

/// An inbound frame could not be decoded into a JSON value.
#[derive(Debug, Error)]
#[error("failed to decode frame ({len} bytes): {source}")]
pub struct DecodeError {
    /// Size of the offending frame.
    pub len: usize,
    /// Underlying JSON error.
    #[source]
    pub source: serde_json::Error,
}

// =============================================================================
// Handler Errors
// =============================================================================

/// Errors produced while running a handler action.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// The action reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The action panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The reply could not be serialized.
    #[error("failed to encode reply: {0}")]
    Encode(String),
}

impl HandlerError {
    /// Creates a failure with the given message.
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

// =============================================================================
// Transport Errors
// =============================================================================

/// Errors that can occur in transport operations.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {url} - {reason}")]
    ConnectionFailed {
        /// The URL that failed to connect.
        url: String,
        /// Reason for failure.
        reason: String,
    },

    /// Connection closed unexpectedly.
    #[error("connection closed: {reason}")]
    ConnectionClosed {
        /// Reason for closure.
        reason: String,
    },

    /// Message send failed.
    #[error("failed to send message: {0}")]
    SendFailed(String),

    /// The peer violated the protocol or the stream broke.
    #[error("protocol error: {0}")]
    Protocol(String),
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for rule matching.
pub type RuleResult<T> = Result<T, RuleError>;

/// Result type produced by handler actions.
pub type HandlerResult = Result<Option<crate::handler::Reply>, HandlerError>;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
