//! Health-check aggregation endpoint
//!
//! Collects pass/fail status from registered dependency checks, merges it
//! into one verdict and serves it on `/healthz`, next to an unconditional
//! `/liveness` probe, with graceful shutdown of the hosting server.

pub mod config;
pub mod health;
pub mod logging;
pub mod server;
