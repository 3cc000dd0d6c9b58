//! Aggregation of dependency checks into one health verdict
//!
//! Every `/healthz` request polls every registered check, in registration
//! order, and shapes the results into a [`HealthResponse`]. Nothing is cached
//! between requests.

use super::check::Provider;
use crate::logging::{self, Logger};
use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, MethodRouter},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Body of the liveness probe
pub const LIVENESS_BODY: &str = "OK";

/// A failed check, as reported in `errors`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthError {
    pub name: String,
    pub message: String,
}

/// Per-check status, as reported in `services` (detailed mode only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub name: String,
    pub healthy: bool,
}

/// JSON body of `/healthz`
///
/// `errors` is omitted when empty; `services` is omitted unless the
/// aggregator runs in detailed mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<HealthError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<ServiceHealth>>,
}

/// Outcome of one poll: the HTTP status and the body to serialize
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub status: StatusCode,
    pub body: HealthResponse,
}

/// Holds the check registry and the response-shaping policy
///
/// The registry is fixed at construction, so an `Arc<Aggregator>` can be
/// shared freely across concurrent requests.
pub struct Aggregator {
    providers: Vec<Provider>,
    detailed: bool,
    failure_code: Option<StatusCode>,
    logger: Arc<dyn Logger>,
}

impl Aggregator {
    /// Create an aggregator over `providers` (summary mode, default failure code)
    pub fn new(providers: Vec<Provider>) -> Self {
        Self {
            providers,
            detailed: false,
            failure_code: None,
            logger: logging::noop(),
        }
    }

    /// Include per-check status records in the response
    pub fn detailed(mut self, detailed: bool) -> Self {
        self.detailed = detailed;
        self
    }

    /// Status returned when any check fails (`None` means 503)
    pub fn failure_code(mut self, code: Option<StatusCode>) -> Self {
        self.failure_code = code;
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    pub fn is_detailed(&self) -> bool {
        self.detailed
    }

    pub(crate) fn log(&self) -> Arc<dyn Logger> {
        Arc::clone(&self.logger)
    }

    /// Poll every check once and derive the status code and body
    pub fn evaluate(&self) -> HealthReport {
        let mut errors = Vec::new();
        let mut services = Vec::with_capacity(self.providers.len());

        for provider in &self.providers {
            let healthy = match provider.evaluate() {
                Ok(()) => true,
                Err(e) => {
                    errors.push(HealthError {
                        name: provider.name().to_string(),
                        message: format!("{:#}", e),
                    });
                    false
                }
            };
            services.push(ServiceHealth {
                name: provider.name().to_string(),
                healthy,
            });
        }

        let status = if errors.is_empty() {
            StatusCode::OK
        } else {
            self.failure_code.unwrap_or(StatusCode::SERVICE_UNAVAILABLE)
        };

        HealthReport {
            status,
            body: HealthResponse {
                healthy: errors.is_empty(),
                errors,
                services: self.detailed.then_some(services),
            },
        }
    }

    /// Poll the checks and render the HTTP response
    ///
    /// A body that fails to serialize is logged and sent empty with the
    /// status already decided.
    pub fn respond(&self) -> Response {
        let report = self.evaluate();
        let body = match serde_json::to_vec(&report.body) {
            Ok(body) => body,
            // Not reachable with the current field types
            Err(e) => {
                self.logger
                    .error(&format!("[healthz] unable to encode health response: {}", e));
                Vec::new()
            }
        };

        let mut response = (report.status, body).into_response();
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }

    /// Handler for `/healthz`
    ///
    /// Checks are blocking, so the whole sequential poll runs on the blocking
    /// pool. The handler future stays pending meanwhile, which lets a timeout
    /// layer around it expire and keeps async workers free.
    pub fn health_handler(self: &Arc<Self>) -> MethodRouter {
        self.logger.info("[healthz] health service started");
        let aggregator = Arc::clone(self);
        get(move || {
            let aggregator = Arc::clone(&aggregator);
            async move {
                let polled = Arc::clone(&aggregator);
                match tokio::task::spawn_blocking(move || polled.respond()).await {
                    Ok(response) => response,
                    Err(e) => aggregator.poll_failed(&e),
                }
            }
        })
    }

    /// Response for a poll that did not finish (a check panicked)
    fn poll_failed(&self, error: &tokio::task::JoinError) -> Response {
        self.logger
            .error(&format!("[healthz] health checks did not complete: {}", error));
        let status = self.failure_code.unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
        let mut response = (status, r#"{"healthy":false}"#).into_response();
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }

    /// Handler for `/liveness`
    ///
    /// Always 200 `OK`; no check is polled.
    pub fn liveness_handler(&self) -> MethodRouter {
        self.logger.info("[healthz] liveness service started");
        get(liveness)
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("providers", &self.providers)
            .field("detailed", &self.detailed)
            .field("failure_code", &self.failure_code)
            .finish_non_exhaustive()
    }
}

async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, LIVENESS_BODY)
}
