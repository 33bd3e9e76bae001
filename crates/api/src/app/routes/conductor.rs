use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::info;

use crate::app::errors::{join_error_to_response, json_error};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/run", post(run))
        .route("/last", get(last))
}

/// Run one cycle now and return its report.
///
/// Overlapping calls (and the periodic runner) are safe: the registry
/// rejects duplicate claims.
pub async fn run(Extension(services): Extension<Arc<AppServices>>) -> Response {
    let conductor = services.conductor.clone();
    match tokio::task::spawn_blocking(move || conductor.run_cycle()).await {
        Ok(result) => {
            info!(
                spawned = result.work_spawned.len(),
                skipped = ?result.skipped_reason,
                "conductor cycle triggered over http"
            );
            services.last_cycle.set(result.clone());
            Json(result).into_response()
        }
        Err(e) => join_error_to_response(e),
    }
}

pub async fn last(Extension(services): Extension<Arc<AppServices>>) -> Response {
    match services.last_cycle.get() {
        Some(result) => Json(result).into_response(),
        None => json_error(StatusCode::NOT_FOUND, "no_cycle_yet", "no conductor cycle has completed yet"),
    }
}
