//! Prometheus scrape endpoint

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use metrics_exporter_prometheus::PrometheusHandle;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

/// Render the call metrics in the Prometheus text format
pub async fn metrics_handler(State(handle): State<PrometheusHandle>) -> Response {
    ([(header::CONTENT_TYPE, TEXT_FORMAT)], handle.render()).into_response()
}

/// Served when `telemetry.metrics_enabled` is off
pub async fn metrics_disabled() -> Response {
    (StatusCode::NOT_FOUND, "metrics are disabled").into_response()
}
