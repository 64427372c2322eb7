use anyhow::Context;
use mediapub_api::setup;
use mediapub_core::Config;
use mediapub_infra::init_telemetry;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::from_env()?;
    config.validate().context("Configuration validation failed")?;

    init_telemetry(config.log_format)
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;
    tracing::info!(environment = %config.environment, "Configuration loaded and validated");

    let pool = setup::database::setup_database(&config).await?;
    let components = setup::services::create_components(&config, pool).await?;
    let app = setup::assemble(&config, components)?;

    let worker = if config.worker_enabled {
        let bus = app.bus.clone();
        Some(tokio::spawn(async move { bus.start_handlers().await }))
    } else {
        tracing::info!("Task bus worker disabled; this process only enqueues");
        None
    };

    let served = setup::server::start_server(&config, app.router).await;

    app.bus.shutdown();
    if let Some(worker) = worker {
        match worker.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Task bus stopped with an error"),
            Err(e) => tracing::error!(error = %e, "Task bus worker panicked"),
        }
    }
    app.state.hooks.shutdown().await;

    served
}
