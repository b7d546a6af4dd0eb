mod common;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use common::{Harness, ScriptedPlatform};
use http_body_util::BodyExt;
use mention_relay::http::{consumer_router, producer_router};
use serde_json::Value;
use tower::ServiceExt;

async fn call(router: &Router, method: Method, uri: &str) -> (StatusCode, Option<String>, Value) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, retry_after, body)
}

#[tokio::test(start_paused = true)]
async fn test_producer_start_stop_are_idempotent() {
    let harness = Harness::new(ScriptedPlatform::default());
    let router = producer_router(harness.producer());

    let (status, _, body) = call(&router, Method::POST, "/start").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Service started");

    let (status, _, body) = call(&router, Method::POST, "/start").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Service is already running");

    let (_, _, body) = call(&router, Method::GET, "/status").await;
    assert_eq!(body["is_running"], true);

    let (_, _, body) = call(&router, Method::POST, "/stop").await;
    assert_eq!(body["message"], "Service stopped");

    let (status, _, body) = call(&router, Method::POST, "/stop").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Service is not running");

    let (_, _, body) = call(&router, Method::GET, "/status").await;
    assert_eq!(body["is_running"], false);
}

#[tokio::test]
async fn test_status_shape() {
    let harness = Harness::new(ScriptedPlatform::with_mentions([1, 2]));
    let producer = harness.producer();
    let router = producer_router(producer.clone());

    let (_, _, before) = call(&router, Method::GET, "/status").await;
    assert_eq!(before["processed_count"], 0);
    assert_eq!(before["error_count"], 0);
    assert!(before["last_activity_time"].is_null());

    producer.poll().await.unwrap();

    let (status, _, after) = call(&router, Method::GET, "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(after["processed_count"], 2);
    assert!(after["last_activity_time"].is_string());
    assert!(after["last_error"].is_null());
}

#[tokio::test]
async fn test_config_rejects_interval_below_floor() {
    let harness = Harness::new(ScriptedPlatform::default());
    let router = producer_router(harness.producer());

    let (status, _, body) = call(&router, Method::PUT, "/config?new_interval=10").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("at least 60"));

    let (status, _, body) =
        call(&router, Method::PUT, "/config?new_interval=18446744073709551615").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("at most"));

    let (status, _, body) = call(&router, Method::PUT, "/config?new_interval=often").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, _, body) = call(&router, Method::PUT, "/config?new_interval=120").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["new_interval"], 120);

    let (_, _, metrics) = call(&router, Method::GET, "/metrics").await;
    assert_eq!(metrics["poll_interval_secs"], 120);
    assert_eq!(metrics["topic"], "twitter.mentions");
}

#[tokio::test(start_paused = true)]
async fn test_fetch_too_soon_is_rate_limited() {
    let harness = Harness::new(ScriptedPlatform::with_mentions([41, 42]));
    let router = producer_router(harness.producer());

    let (status, _, body) = call(&router, Method::POST, "/fetch").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["published"], 2);
    assert_eq!(body["cursor"], "42");

    let (status, retry_after, body) = call(&router, Method::POST, "/fetch").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"].as_str().unwrap().contains("manual-fetch"));
    let retry_after: u64 = retry_after.unwrap().parse().unwrap();
    assert!((1..=30).contains(&retry_after));

    let (_, _, metrics) = call(&router, Method::GET, "/metrics").await;
    assert_eq!(metrics["cursor"], "42");
    assert_eq!(metrics["error_count"], 0);
}

#[tokio::test]
async fn test_fetch_failure_is_bad_gateway() {
    let harness = Harness::new(ScriptedPlatform::default());
    harness.platform.fail_next_fetches(1);
    let router = producer_router(harness.producer());

    let (status, _, body) = call(&router, Method::POST, "/fetch").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["error"].as_str().unwrap().contains("503"));

    let (_, _, status_body) = call(&router, Method::GET, "/status").await;
    assert_eq!(status_body["error_count"], 1);
}

#[tokio::test(start_paused = true)]
async fn test_consumer_surface() {
    let harness = Harness::new(ScriptedPlatform::default());
    let router = consumer_router(harness.consumer().await);

    let (status, _, banner) = call(&router, Method::GET, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert!(banner["message"].is_string());

    let (_, _, metrics) = call(&router, Method::GET, "/metrics").await;
    assert_eq!(metrics["style"], "savage");
    assert_eq!(metrics["consumer_group"], "twitter_roaster_group");
    assert_eq!(metrics["dead_lettered_count"], 0);

    let (_, _, body) = call(&router, Method::POST, "/start").await;
    assert_eq!(body["message"], "Service started");
    let (_, _, body) = call(&router, Method::POST, "/stop").await;
    assert_eq!(body["message"], "Service stopped");

    // Producer-only routes are absent
    let (status, _, _) = call(&router, Method::POST, "/fetch").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
