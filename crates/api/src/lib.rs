//! Order-fulfillment worker service.
//!
//! Runs the lifecycle sweep, the compensation listener, stock reconciliation
//! and outbox re-publishing in the background, and exposes `/health` and
//! `/metrics` for operators.

pub mod config;
pub mod routes;
pub mod status;
pub mod workers;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

pub use config::{Config, ConfigError, LogFormat};
pub use status::{StatusBoard, StatusSnapshot};
pub use workers::{Backends, Workers};

/// Creates the operational router.
pub fn create_app(status: Arc<StatusBoard>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .with_state(status)
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
}
