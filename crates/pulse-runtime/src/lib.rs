//! Pulse Runtime - Worker and pool orchestration for the Pulse load harness.
//!
//! This crate provides:
//! - Connection workers (`ConnectionWorker`): one connection, one private
//!   state, the receive/match/dispatch loop
//! - The pool orchestrator (`Pool`, `PoolBuilder`): N independent workers
//!   against one endpoint, with an optional duration budget
//! - Configuration loading (`ConfigLoader`) from TOML files and `PULSE_*`
//!   environment variables
//! - Logging configuration (`LoggingBuilder`)
//!
//! ```ignore
//! use pulse_runtime::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigLoader::new().load()?;
//!     logging::init_from_config(&config.logging);
//!
//!     let pool = PoolBuilder::<()>::default()
//!         .from_config(&config.pool)
//!         .handler(on(["type"], "ping").reply(|_, _| json!({ "type": "pong" })))
//!         .build()?;
//!
//!     let report = pool.run_until(shutdown_signal()).await;
//!     info!(succeeded = report.succeeded(), failed = report.failed(), "Done");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod pool;
pub mod worker;

// Re-exports
pub use config::{ConfigError, ConfigLoader, ConfigResult, LoggingConfig, PoolConfig, PulseConfig};
pub use error::{RuntimeError, RuntimeResult, WorkerError};
pub use logging::{LoggingBuilder, SpanEvents};
pub use pool::{Pool, PoolBuilder, PoolReport, shutdown_signal};
pub use worker::{
    ConnectionWorker, DispatchMode, OnConnect, WorkerOptions, WorkerOutcome, WorkerStats,
    WorkerStatus,
};

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Prelude module for convenient imports.
///
/// This provides all the commonly used logging macros:
/// - `trace!`, `debug!`, `info!`, `warn!`, `error!`
/// - `span`, `event`
/// - `instrument` attribute
/// - `Level` for span creation
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};

    pub use crate::logging;
    pub use crate::{
        ConfigLoader, DispatchMode, LoggingBuilder, Pool, PoolBuilder, PoolReport, WorkerStatus,
        shutdown_signal,
    };
    pub use pulse_core::{ConnectionState, Handler, Message, Reply, on};
}
