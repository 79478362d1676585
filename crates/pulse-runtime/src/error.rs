//! Runtime error types.

use pulse_core::TransportError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur while assembling a pool.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The pool builder was given an unusable combination of settings.
    #[error("Invalid pool: {0}")]
    InvalidPool(String),
}

/// Why a worker ended in the `Failed` state.
#[derive(Error, Debug, Clone)]
pub enum WorkerError {
    /// The transport failed while connecting or while active.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The worker task itself panicked.
    #[error("Worker panicked: {0}")]
    Panicked(String),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
