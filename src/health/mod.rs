//! Health aggregation
//!
//! Provides the two probe handlers served by the health server:
//! - `/healthz` - polls every registered check and reports the aggregate verdict
//! - `/liveness` - answers `OK` as long as the process serves HTTP

mod aggregator;
mod check;

pub use aggregator::{
    Aggregator, HealthError, HealthReport, HealthResponse, ServiceHealth, LIVENESS_BODY,
};
pub use check::{Check, FlagCheck, Provider, TcpCheck};

#[cfg(test)]
#[path = "aggregator_test.rs"]
mod aggregator_tests;

#[cfg(test)]
#[path = "check_test.rs"]
mod check_tests;
