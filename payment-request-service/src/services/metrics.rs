//! Prometheus metrics for payment-request-service.

use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Counter for gRPC requests by method and status.
pub static GRPC_REQUESTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "payment_request_grpc_requests_total",
        "Total number of gRPC requests",
        &["method", "status"]
    )
    .expect("Failed to register GRPC_REQUESTS")
});

/// Histogram for gRPC request duration by method.
pub static GRPC_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "payment_request_grpc_request_duration_seconds",
        "gRPC request duration in seconds",
        &["method"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register GRPC_REQUEST_DURATION")
});

/// Counter for side-port HTTP requests by route and status.
pub static HTTP_REQUESTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "payment_request_http_requests_total",
        "Total number of HTTP requests",
        &["method", "route", "status"]
    )
    .expect("Failed to register HTTP_REQUESTS")
});

pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "payment_request_http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "route"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register HTTP_REQUEST_DURATION")
});

pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "payment_request_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for lifecycle operations (apply, approve, pay, ...).
pub static LIFECYCLE_OPERATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "payment_request_lifecycle_operations_total",
        "Total number of payment request lifecycle operations",
        &["operation", "status"]
    )
    .expect("Failed to register LIFECYCLE_OPERATIONS")
});

/// Records dropped from an apply because another batch took them first.
pub static EXCLUDED_RECORDS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "payment_request_excluded_records_total",
        "Total number of records excluded from an apply",
        &["operation"]
    )
    .expect("Failed to register EXCLUDED_RECORDS")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "payment_request_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&GRPC_REQUESTS);
    Lazy::force(&GRPC_REQUEST_DURATION);
    Lazy::force(&HTTP_REQUESTS);
    Lazy::force(&HTTP_REQUEST_DURATION);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&LIFECYCLE_OPERATIONS);
    Lazy::force(&EXCLUDED_RECORDS);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Axum middleware recording request count and latency per matched route.
/// Unmatched paths share one label.
pub async fn http_metrics_middleware(req: Request, next: Next) -> Response {
    let timer = std::time::Instant::now();
    let method = req.method().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    HTTP_REQUESTS
        .with_label_values(&[&method, &route, &status])
        .inc();
    HTTP_REQUEST_DURATION
        .with_label_values(&[&method, &route])
        .observe(timer.elapsed().as_secs_f64());

    response
}

pub fn record_grpc_request(method: &str, status: &str) {
    GRPC_REQUESTS.with_label_values(&[method, status]).inc();
}

pub fn record_grpc_request_duration(method: &str, duration_secs: f64) {
    GRPC_REQUEST_DURATION
        .with_label_values(&[method])
        .observe(duration_secs);
}

pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}

pub fn record_lifecycle_operation(operation: &str, status: &str) {
    LIFECYCLE_OPERATIONS
        .with_label_values(&[operation, status])
        .inc();
}

pub fn record_excluded_records(operation: &str, count: usize) {
    EXCLUDED_RECORDS
        .with_label_values(&[operation])
        .inc_by(count as f64);
}
