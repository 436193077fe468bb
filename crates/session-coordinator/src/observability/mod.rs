//! Observability: health probes and Prometheus metrics.

pub mod health;

pub use health::{health_router, HealthState};

use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;

/// Create the metrics router serving `GET /metrics`.
///
/// Renders everything recorded through the `metrics` macros (the `tt_`
/// gauges and counters) in Prometheus text format.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route("/metrics", get(move || async move { handle.render() }))
}
