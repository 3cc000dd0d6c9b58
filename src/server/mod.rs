//! HTTP server for the health endpoints
//!
//! Serves the aggregator's probes:
//! - `/healthz` - aggregate dependency health
//! - `/liveness` - process is serving HTTP
//!
//! Also provides graceful shutdown handling for SIGTERM/SIGINT.

mod idle;
mod lifecycle;
pub mod shutdown;

pub use idle::{IdleTimeoutAcceptor, IdleTimeoutStream};
pub use lifecycle::{
    Completion, HealthServer, LifecycleState, ServerDescriptor, ServerError, HEALTHZ_PATH,
    IDLE_TIMEOUT, LIVENESS_PATH, READ_TIMEOUT, SHUTDOWN_TIMEOUT, WRITE_TIMEOUT,
};
pub use shutdown::{shutdown_channel, ShutdownController, ShutdownSignal, Signals};

#[cfg(test)]
#[path = "lifecycle_test.rs"]
mod lifecycle_tests;

#[cfg(test)]
#[path = "idle_test.rs"]
mod idle_tests;

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;
