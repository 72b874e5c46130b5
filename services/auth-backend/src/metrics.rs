//! Prometheus metrics exposition
//!
//! Request-level metrics are recorded here; session and sign-in counters are
//! recorded by `session_manager`:
//!
//! - `auth_requests_total` (counter): labels `route`, `status`
//! - `auth_request_duration_seconds` (histogram): label `route`
//! - `auth_sign_ins_total` (counter): labels `provider`, `outcome`
//! - `auth_refresh_total` (counter): label `outcome`
//! - `auth_security_events_total` (counter): label `kind`
//! - `auth_sessions_swept_total` (counter)

use std::time::Instant;

use axum::extract::{MatchedPath, Request};
use axum::middleware::Next;
use axum::response::Response;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "auth_request_duration_seconds";

/// Bucket boundaries from 1ms to 15s. The upper end covers a callback that
/// waits on a slow provider until the provider timeout.
const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
}

/// Install the process-wide Prometheus recorder.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

pub fn record_request(route: &str, status: u16, duration_secs: f64) {
    metrics::counter!(
        "auth_requests_total",
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!(DURATION_METRIC, "route" => route.to_string()).record(duration_secs);
}

/// Middleware recording count and latency per matched route. Unmatched
/// paths share one label so scanners cannot blow up the label set.
pub async fn track_requests(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let started = Instant::now();

    let response = next.run(request).await;
    record_request(
        &route,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}
