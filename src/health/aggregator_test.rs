//! Tests for health aggregation and response shaping

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use super::*;
use crate::logging::testing::{Level, RecordingLogger};
use anyhow::anyhow;
use axum::{
    body::{to_bytes, Body},
    http::{header::CONTENT_TYPE, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceExt;
use tower_http::timeout::TimeoutLayer;

fn passing(name: &str) -> Provider {
    Provider::from_fn(name, || Ok(()))
}

fn failing(name: &str, reason: &'static str) -> Provider {
    Provider::from_fn(name, move || Err(anyhow!(reason)))
}

fn sleeping(name: &str, duration: Duration) -> Provider {
    Provider::from_fn(name, move || {
        std::thread::sleep(duration);
        Ok(())
    })
}

fn router(aggregator: Aggregator) -> Router {
    let aggregator = Arc::new(aggregator);
    Router::new()
        .route("/healthz", aggregator.health_handler())
        .route("/liveness", aggregator.liveness_handler())
}

async fn get(router: Router, path: &str) -> (StatusCode, Option<String>, Vec<u8>) {
    let response = router
        .oneshot(Request::get(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .map(|v| v.to_str().unwrap().to_string());
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, content_type, body.to_vec())
}

async fn get_json(router: Router, path: &str) -> (StatusCode, Value) {
    let (status, _, body) = get(router, path).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[test]
fn test_empty_registry_is_healthy() {
    let report = Aggregator::new(vec![]).evaluate();

    assert_eq!(report.status, StatusCode::OK);
    assert!(report.body.healthy);
    assert!(report.body.errors.is_empty());
    assert_eq!(report.body.services, None);
}

#[test]
fn test_empty_registry_detailed_has_empty_services() {
    let report = Aggregator::new(vec![]).detailed(true).evaluate();

    assert_eq!(report.status, StatusCode::OK);
    assert_eq!(report.body.services, Some(vec![]));
}

#[test]
fn test_all_passing_detailed_keeps_registration_order() {
    let aggregator = Aggregator::new(vec![
        passing("test1"),
        passing("Test2"),
        passing("Test3"),
        passing("Test4"),
    ])
    .detailed(true);

    let report = aggregator.evaluate();

    assert_eq!(report.status, StatusCode::OK);
    assert!(report.body.healthy);
    assert!(report.body.errors.is_empty());
    let names: Vec<_> = report
        .body
        .services
        .as_ref()
        .unwrap()
        .iter()
        .map(|s| (s.name.as_str(), s.healthy))
        .collect();
    assert_eq!(
        names,
        vec![
            ("test1", true),
            ("Test2", true),
            ("Test3", true),
            ("Test4", true)
        ]
    );
}

#[test]
fn test_mixed_registry_reports_each_failure() {
    let aggregator = Aggregator::new(vec![
        passing("test1"),
        failing("Test2", "Test2-provider_failed"),
        passing("Test3"),
        failing("Test4", "Test4-provider_failed"),
    ])
    .detailed(true);

    let report = aggregator.evaluate();

    assert_eq!(report.status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(!report.body.healthy);
    assert_eq!(
        report.body.errors,
        vec![
            HealthError {
                name: "Test2".to_string(),
                message: "Test2-provider_failed".to_string()
            },
            HealthError {
                name: "Test4".to_string(),
                message: "Test4-provider_failed".to_string()
            },
        ]
    );
    let unhealthy: Vec<_> = report
        .body
        .services
        .unwrap()
        .into_iter()
        .filter(|s| !s.healthy)
        .map(|s| s.name)
        .collect();
    assert_eq!(unhealthy, vec!["Test2", "Test4"]);
}

#[test]
fn test_failure_message_includes_context_chain() {
    use anyhow::Context;

    let aggregator = Aggregator::new(vec![Provider::from_fn("DB", || {
        Err(anyhow!("connection refused")).context("pinging primary")
    })]);

    let report = aggregator.evaluate();

    assert_eq!(
        report.body.errors[0].message,
        "pinging primary: connection refused"
    );
}

#[test]
fn test_duplicate_names_are_reported_twice() {
    let aggregator = Aggregator::new(vec![
        failing("DB", "primary down"),
        failing("DB", "replica down"),
    ])
    .detailed(true);

    let report = aggregator.evaluate();

    assert_eq!(report.body.errors.len(), 2);
    assert_eq!(report.body.services.unwrap().len(), 2);
}

#[test]
fn test_failure_code_override_only_changes_status() {
    let aggregator =
        Aggregator::new(vec![failing("X", "x-err")]).failure_code(Some(StatusCode::OK));

    let report = aggregator.evaluate();

    assert_eq!(report.status, StatusCode::OK);
    assert!(!report.body.healthy);
    assert_eq!(report.body.errors.len(), 1);
}

#[test]
fn test_failure_code_override_ignored_when_healthy() {
    let aggregator = Aggregator::new(vec![passing("X")])
        .failure_code(Some(StatusCode::INTERNAL_SERVER_ERROR));

    assert_eq!(aggregator.evaluate().status, StatusCode::OK);
}

#[test]
fn test_checks_polled_on_every_evaluation() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let aggregator = Aggregator::new(vec![Provider::from_fn("counted", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })]);

    aggregator.evaluate();
    aggregator.evaluate();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_flag_check_state_is_reflected_per_poll() {
    let flag = FlagCheck::new();
    let aggregator = Aggregator::new(vec![Provider::new("worker", flag.clone())]);

    assert!(aggregator.evaluate().body.healthy);

    flag.set_unhealthy("worker stalled");
    let report = aggregator.evaluate();
    assert!(!report.body.healthy);
    assert_eq!(report.body.errors[0].message, "worker stalled");

    flag.set_healthy();
    assert!(aggregator.evaluate().body.healthy);
}

#[tokio::test]
async fn test_healthz_failing_summary_body() {
    let aggregator = Aggregator::new(vec![failing("DB", "DB-timeout"), passing("Cache")]);

    let (status, content_type, body) = get(router(aggregator), "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(content_type.as_deref(), Some("application/json"));
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        body,
        json!({"healthy": false, "errors": [{"name": "DB", "message": "DB-timeout"}]})
    );
}

#[tokio::test]
async fn test_healthz_failing_detailed_body() {
    let aggregator =
        Aggregator::new(vec![failing("DB", "DB-timeout"), passing("Cache")]).detailed(true);

    let (status, body) = get_json(router(aggregator), "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        body["services"],
        json!([{"name": "DB", "healthy": false}, {"name": "Cache", "healthy": true}])
    );
}

#[tokio::test]
async fn test_healthz_healthy_omits_errors_and_services() {
    let (status, body) = get_json(router(Aggregator::new(vec![passing("Test2")])), "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"healthy": true}));
}

#[tokio::test]
async fn test_healthz_is_idempotent() {
    let aggregator = Arc::new(
        Aggregator::new(vec![failing("DB", "DB-timeout"), passing("Cache")]).detailed(true),
    );
    let router = Router::new().route("/healthz", aggregator.health_handler());

    let (_, _, first) = get(router.clone(), "/healthz").await;
    let (_, _, second) = get(router, "/healthz").await;

    assert_eq!(first, second);
}

#[tokio::test]
async fn test_liveness_ignores_failing_checks() {
    let aggregator = Aggregator::new(vec![failing("DB", "DB-timeout")]);

    let (status, _, body) = get(router(aggregator), "/liveness").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, LIVENESS_BODY.as_bytes());
}

#[tokio::test]
async fn test_liveness_with_no_checks() {
    let (status, _, body) = get(router(Aggregator::new(vec![])), "/liveness").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");
}

/// Test that a slow poll does not hold the runtime, so a timeout layer fires
#[tokio::test]
async fn test_healthz_slow_check_hits_timeout_layer() {
    let aggregator = Arc::new(Aggregator::new(vec![sleeping("slow", Duration::from_secs(1))]));
    let router = Router::new()
        .route("/healthz", aggregator.health_handler())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_millis(100),
        ));

    let started = Instant::now();
    let (status, _, _) = get(router, "/healthz").await;

    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    assert!(started.elapsed() < Duration::from_millis(900));
}

/// Test that liveness answers while a slow poll is in flight on one worker
#[tokio::test]
async fn test_liveness_answers_during_slow_poll() {
    let router = router(Aggregator::new(vec![sleeping("slow", Duration::from_secs(1))]));

    let in_flight = tokio::spawn(get(router.clone(), "/healthz"));
    tokio::task::yield_now().await;

    let started = Instant::now();
    let (status, _, body) = get(router, "/liveness").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");
    assert!(started.elapsed() < Duration::from_millis(500));

    let (status, _, _) = in_flight.await.unwrap();
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_panicking_check_reports_failure() {
    let logger = Arc::new(RecordingLogger::default());
    let aggregator = Aggregator::new(vec![Provider::from_fn("broken", || -> anyhow::Result<()> {
        panic!("check blew up")
    })])
    .failure_code(Some(StatusCode::INTERNAL_SERVER_ERROR))
    .logger(logger.clone());

    let (status, content_type, body) = get(router(aggregator), "/healthz").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(content_type.as_deref(), Some("application/json"));
    assert_eq!(
        serde_json::from_slice::<Value>(&body).unwrap(),
        json!({"healthy": false})
    );
    assert_eq!(logger.count(Level::Error), 1);
}

#[test]
fn test_handlers_log_once_at_construction() {
    let logger = Arc::new(RecordingLogger::default());
    let aggregator = Arc::new(Aggregator::new(vec![]).logger(logger.clone()));

    let _ = aggregator.health_handler();
    let _ = aggregator.liveness_handler();
    aggregator.evaluate();

    assert_eq!(logger.count(Level::Info), 2);
    assert_eq!(logger.count(Level::Error), 0);
}
