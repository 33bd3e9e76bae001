use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use conductor_api::app::{build_app, services};
use conductor_infra::ConductorRunner;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    conductor_observability::init();

    let settings = services::ApiSettings::from_env()?;
    let app_services = Arc::new(services::build_services(&settings).await?);

    let runner = match settings.tick_interval {
        Some(interval) => Some(
            ConductorRunner::every(interval)
                .spawn("conductor.runner", app_services.conductor.clone(), app_services.last_cycle.clone())
                .context("failed to start conductor runner")?,
        ),
        None => {
            info!("CONDUCTOR_TICK_SECS=0; cycles run only via POST /conductor/run");
            None
        }
    };

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;

    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, build_app(app_services))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if let Some(runner) = runner {
        // Joins the runner thread, which may be mid-cycle.
        tokio::task::spawn_blocking(move || runner.shutdown()).await?;
    }
    Ok(())
}
