//! Health check handler.

use crate::models::api::HealthResponse;
use crate::routes::AppState;
use axum::extract::State;
use axum::Json;
use std::sync::Arc;
use tracing::instrument;

/// Handler for GET /health
///
/// Pings the store and reports stream delivery mode and open stream count.
/// Never errors: an unreachable database is reported as `"unhealthy"` with
/// a 200 so the probe can read the body.
///
/// ```json
/// {
///   "status": "healthy",
///   "database": "healthy",
///   "streamDelivery": "push",
///   "openStreams": 3
/// }
/// ```
#[instrument(skip_all, name = "ds.health.check")]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let db_healthy = match state.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(target: "ds.handlers.health", error = %e, "Store ping failed");
            false
        }
    };

    let status = if db_healthy { "healthy" } else { "unhealthy" };

    Json(HealthResponse {
        status: status.to_string(),
        database: Some(status.to_string()),
        stream_delivery: state.broadcaster.delivery().as_str().to_string(),
        open_streams: state.broadcaster.open_stream_count(),
    })
}
