use fiscal_pipeline_orchestrator::{api::start_server, Orchestrator, PipelineConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = PipelineConfig::from_env()?;

    info!("Fiscal Pipeline Orchestrator - API Server");
    info!(port = config.port, "Configuration loaded");

    let orchestrator = Arc::new(Orchestrator::from_config(&config).await?);
    let _sweeper = orchestrator.spawn_retention_sweeper(RETENTION_SWEEP_INTERVAL);

    info!("Orchestrator initialized, starting API server");

    start_server(orchestrator, config.port).await?;

    Ok(())
}
