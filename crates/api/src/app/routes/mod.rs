use axum::response::Response;
use axum::Router;

use conductor_engine::{ProcessRegistry, RegistryError};

use crate::app::errors::{join_error_to_response, registry_error_to_response};
use crate::app::services::AppServices;

pub mod conductor;
pub mod processes;
pub mod system;

pub fn router() -> Router {
    Router::new()
        .nest("/conductor", conductor::router())
        .nest("/processes", processes::router())
}

/// Run a registry call on the blocking pool; adapters may block on I/O.
pub(crate) async fn registry_call<T, F>(services: &AppServices, f: F) -> Result<T, Response>
where
    F: FnOnce(&dyn ProcessRegistry) -> Result<T, RegistryError> + Send + 'static,
    T: Send + 'static,
{
    let registry = services.registry.clone();
    tokio::task::spawn_blocking(move || f(registry.as_ref()))
        .await
        .map_err(join_error_to_response)?
        .map_err(registry_error_to_response)
}
