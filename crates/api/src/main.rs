use std::sync::Arc;

use anyhow::Context;

use moodscope_infra::{Orchestrator, OrchestratorConfig};
use moodscope_insights::{SyntheticListeningSource, TemplateGenerator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    moodscope_observability::init();

    let config = OrchestratorConfig::from_env().context("invalid configuration")?;
    let bind_addr = config.bind_addr.clone();

    let orchestrator = Arc::new(
        Orchestrator::from_config(config)
            .await
            .context("failed to initialise backends")?,
    );
    let runtime = orchestrator.start(
        Arc::new(SyntheticListeningSource::new()),
        Arc::new(TemplateGenerator::new()),
    );

    let app = moodscope_api::app::build_app(orchestrator);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("shutting down workers");
    runtime.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
