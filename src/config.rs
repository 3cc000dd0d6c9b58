//! Configuration from environment variables
//!
//! | Variable | Default |
//! |---|---|
//! | `HEALTHZ_LISTEN_ADDR` | `0.0.0.0:8080` |
//! | `HEALTHZ_DETAILED` | `false` |
//! | `HEALTHZ_FAILURE_CODE` | `0` (503) |
//! | `HEALTHZ_TCP_CHECKS` | empty, `name=host:port,...` |
//! | `HEALTHZ_CHECK_TIMEOUT_MS` | `500` |

use crate::health::{Aggregator, Provider, TcpCheck};
use crate::logging::Logger;
use axum::http::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default listen address for the health endpoints
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Default connect timeout for TCP dependency checks
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_millis(500);

pub const ENV_LISTEN_ADDR: &str = "HEALTHZ_LISTEN_ADDR";
pub const ENV_DETAILED: &str = "HEALTHZ_DETAILED";
pub const ENV_FAILURE_CODE: &str = "HEALTHZ_FAILURE_CODE";
pub const ENV_TCP_CHECKS: &str = "HEALTHZ_TCP_CHECKS";
pub const ENV_CHECK_TIMEOUT_MS: &str = "HEALTHZ_CHECK_TIMEOUT_MS";

/// Errors that can occur while reading configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: expected true/false/1/0, got {value:?}")]
    InvalidBool { var: &'static str, value: String },

    #[error("{var}: expected a number, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{var}: {value} is not a valid HTTP status code")]
    InvalidStatusCode { var: &'static str, value: u16 },

    #[error("{var}: expected name=host:port, got {entry:?}")]
    InvalidTcpCheck { var: &'static str, entry: String },
}

/// A TCP dependency to probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpCheckConfig {
    pub name: String,
    pub target: String,
}

/// Health service configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub listen_addr: String,
    pub detailed: bool,
    /// Status for a failing verdict; `None` means 503
    pub failure_code: Option<StatusCode>,
    pub tcp_checks: Vec<TcpCheckConfig>,
    pub check_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            detailed: false,
            failure_code: None,
            tcp_checks: Vec::new(),
            check_timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }
}

impl Config {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, which returns a variable's value
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let listen_addr = var(ENV_LISTEN_ADDR).unwrap_or(defaults.listen_addr);
        let detailed = match var(ENV_DETAILED) {
            Some(value) => parse_bool(ENV_DETAILED, &value)?,
            None => defaults.detailed,
        };
        let failure_code = match var(ENV_FAILURE_CODE) {
            Some(value) => parse_failure_code(&value)?,
            None => defaults.failure_code,
        };
        let tcp_checks = match var(ENV_TCP_CHECKS) {
            Some(value) => parse_tcp_checks(&value)?,
            None => defaults.tcp_checks,
        };
        let check_timeout = match var(ENV_CHECK_TIMEOUT_MS) {
            Some(value) => Duration::from_millis(parse_number(ENV_CHECK_TIMEOUT_MS, &value)?),
            None => defaults.check_timeout,
        };

        Ok(Self {
            listen_addr,
            detailed,
            failure_code,
            tcp_checks,
            check_timeout,
        })
    }

    /// Build the aggregator described by this configuration
    pub fn aggregator(&self, logger: Arc<dyn Logger>) -> Aggregator {
        let providers = self
            .tcp_checks
            .iter()
            .map(|check| {
                Provider::new(
                    check.name.clone(),
                    TcpCheck::new(check.target.clone(), self.check_timeout),
                )
            })
            .collect();

        Aggregator::new(providers)
            .detailed(self.detailed)
            .failure_code(self.failure_code)
            .logger(logger)
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            var,
            value: value.to_string(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidNumber {
            var,
            value: value.to_string(),
        })
}

fn parse_failure_code(value: &str) -> Result<Option<StatusCode>, ConfigError> {
    let code: u16 = parse_number(ENV_FAILURE_CODE, value)?;
    if code == 0 {
        return Ok(None);
    }
    StatusCode::from_u16(code)
        .map(Some)
        .map_err(|_| ConfigError::InvalidStatusCode {
            var: ENV_FAILURE_CODE,
            value: code,
        })
}

fn parse_tcp_checks(value: &str) -> Result<Vec<TcpCheckConfig>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((name, target)) if !name.trim().is_empty() && !target.trim().is_empty() => {
                Ok(TcpCheckConfig {
                    name: name.trim().to_string(),
                    target: target.trim().to_string(),
                })
            }
            _ => Err(ConfigError::InvalidTcpCheck {
                var: ENV_TCP_CHECKS,
                entry: entry.to_string(),
            }),
        })
        .collect()
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
