//! Configuration module for the Pulse runtime.
//!
//! This module provides TOML and environment based configuration loading
//! and validation for pools and logging.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile};
pub use schema::{
    LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig, PoolConfig, PulseConfig,
    SpanEventConfig,
};
pub use validation::{validate_config, validate_endpoint};
