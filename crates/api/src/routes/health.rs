//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::status::StatusBoard;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Events waiting in the publisher outbox.
    pub outbox_pending: usize,
    /// Messages the compensation listener cannot get past.
    pub stuck_messages: usize,
    /// Products whose stock counter disagreed with inventory on the last reconciliation.
    pub drifted_products: usize,
}

/// GET /health: outbox, listener and reconciliation status.
///
/// Reports `degraded` while any message is stuck; the service keeps running.
pub async fn check(State(status): State<Arc<StatusBoard>>) -> Json<HealthResponse> {
    let snapshot = status.snapshot();
    Json(HealthResponse {
        status: if snapshot.stuck_messages > 0 {
            "degraded"
        } else {
            "ok"
        },
        outbox_pending: snapshot.outbox_pending,
        stuck_messages: snapshot.stuck_messages,
        drifted_products: snapshot.drifted_products,
    })
}
