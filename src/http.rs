//! HTTP control surfaces for the producer and consumer services.

use crate::consumer::Consumer;
use crate::producer::Producer;
use crate::service::Toggle;
use crate::Error;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Control-surface error rendered as `{"error": "<message>"}`
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Timeout(_)
            | Error::Platform(_)
            | Error::Generation(_)
            | Error::Queue(_)
            | Error::DynamoDb(_)
            | Error::Cache(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut response =
            (status, Json(json!({ "error": self.0.to_string() }))).into_response();

        if let Error::RateLimited { retry_after, .. } = &self.0 {
            // Round up so clients never retry a moment too early
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

fn toggle_response(toggle: Toggle) -> Json<serde_json::Value> {
    Json(json!({ "message": toggle.message() }))
}

fn traced(router: Router) -> Router {
    router.layer(
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            tracing::info_span!(
                "http_request",
                method = %request.method(),
                path = %request.uri().path(),
            )
        }),
    )
}

pub fn producer_router(producer: Arc<Producer>) -> Router {
    traced(
        Router::new()
            .route("/", get(producer_banner))
            .route("/status", get(producer_status))
            .route("/metrics", get(producer_metrics))
            .route("/start", post(producer_start))
            .route("/stop", post(producer_stop))
            .route("/config", put(producer_config))
            .route("/fetch", post(producer_fetch))
            .with_state(producer),
    )
}

pub fn consumer_router(consumer: Arc<Consumer>) -> Router {
    traced(
        Router::new()
            .route("/", get(consumer_banner))
            .route("/status", get(consumer_status))
            .route("/metrics", get(consumer_metrics))
            .route("/start", post(consumer_start))
            .route("/stop", post(consumer_stop))
            .with_state(consumer),
    )
}

async fn producer_banner() -> impl IntoResponse {
    Json(json!({ "message": "Mention producer service" }))
}

async fn producer_status(State(producer): State<Arc<Producer>>) -> impl IntoResponse {
    Json(producer.status())
}

async fn producer_metrics(
    State(producer): State<Arc<Producer>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(producer.metrics().await?))
}

async fn producer_start(State(producer): State<Arc<Producer>>) -> impl IntoResponse {
    toggle_response(producer.start().await)
}

async fn producer_stop(State(producer): State<Arc<Producer>>) -> impl IntoResponse {
    toggle_response(producer.stop().await)
}

#[derive(Debug, Deserialize)]
struct IntervalParams {
    new_interval: u64,
}

async fn producer_config(
    State(producer): State<Arc<Producer>>,
    params: Result<Query<IntervalParams>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(params) = params.map_err(|e| Error::Validation(e.body_text()))?;
    let interval = producer.set_interval(params.new_interval)?;
    Ok(Json(json!({
        "message": "Polling interval updated",
        "new_interval": interval.as_secs(),
    })))
}

async fn producer_fetch(
    State(producer): State<Arc<Producer>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(producer.fetch().await?))
}

async fn consumer_banner() -> impl IntoResponse {
    Json(json!({ "message": "Mention consumer service" }))
}

async fn consumer_status(State(consumer): State<Arc<Consumer>>) -> impl IntoResponse {
    Json(consumer.status())
}

async fn consumer_metrics(State(consumer): State<Arc<Consumer>>) -> impl IntoResponse {
    Json(consumer.metrics())
}

async fn consumer_start(State(consumer): State<Arc<Consumer>>) -> impl IntoResponse {
    toggle_response(consumer.start().await)
}

async fn consumer_stop(State(consumer): State<Arc<Consumer>>) -> impl IntoResponse {
    toggle_response(consumer.stop().await)
}
