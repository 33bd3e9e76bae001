use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};

use conductor_core::ProcessId;

use super::registry_call;
use crate::app::errors::json_error;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/active", get(active))
        .route("/running", get(running))
        .route("/:id", get(get_process))
}

/// Running record counts, grouped by process type.
pub async fn active(Extension(services): Extension<Arc<AppServices>>) -> Response {
    match registry_call(&services, |r| r.count_active()).await {
        Ok(counts) => Json(counts).into_response(),
        Err(resp) => resp,
    }
}

pub async fn running(Extension(services): Extension<Arc<AppServices>>) -> Response {
    match registry_call(&services, |r| r.list_running()).await {
        Ok(records) => Json(records).into_response(),
        Err(resp) => resp,
    }
}

pub async fn get_process(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let id: ProcessId = match id.parse() {
        Ok(v) => v,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("{e}")),
    };

    match registry_call(&services, move |r| r.get(id)).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "not_found", format!("process {id} not found")),
        Err(resp) => resp,
    }
}
