//! Logging sinks for the health service
//!
//! The library only ever logs through a [`Logger`] handed to it by the
//! embedding process. Two implementations ship with the crate:
//! - [`NoopLogger`] - discards everything (the default)
//! - [`TracingLogger`] - forwards to `tracing`
//!
//! `fatal` marks conditions the embedding process is expected to act on
//! (exit, restart). It never aborts the process from library code.

use std::sync::Arc;
use tracing::{error, info};

/// Log sink injected into the aggregator and the server
pub trait Logger: Send + Sync {
    fn info(&self, message: &str);
    fn error(&self, message: &str);
    fn fatal(&self, message: &str);
}

/// Sink that drops every message
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn info(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
    fn fatal(&self, _message: &str) {}
}

/// Sink that forwards to the process-wide `tracing` subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn info(&self, message: &str) {
        info!("{}", message);
    }

    fn error(&self, message: &str) {
        error!("{}", message);
    }

    fn fatal(&self, message: &str) {
        error!(fatal = true, "{}", message);
    }
}

/// Shared no-op sink, used wherever no logger was configured
pub fn noop() -> Arc<dyn Logger> {
    Arc::new(NoopLogger)
}

/// Initialize the `tracing` subscriber for the binary
///
/// Honors `RUST_LOG`, falling back to `info`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
