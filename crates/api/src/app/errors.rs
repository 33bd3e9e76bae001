use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use conductor_engine::RegistryError;

pub fn registry_error_to_response(err: RegistryError) -> axum::response::Response {
    match err {
        RegistryError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("process {id} not found")),
        RegistryError::AlreadyTerminal { .. } => json_error(StatusCode::CONFLICT, "already_terminal", err.to_string()),
        RegistryError::InvalidCompletion(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invalid_completion", msg)
        }
        RegistryError::Unavailable(msg) => json_error(StatusCode::SERVICE_UNAVAILABLE, "registry_unavailable", msg),
        RegistryError::Storage(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", msg),
    }
}

/// A blocking task was cancelled or panicked.
pub fn join_error_to_response(err: tokio::task::JoinError) -> axum::response::Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", err.to_string())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
