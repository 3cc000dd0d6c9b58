use healthz::config::Config;
use healthz::logging::{init_tracing, Logger, TracingLogger};
use healthz::server::HealthServer;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting healthz service");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };
    info!(
        listen_addr = %config.listen_addr,
        detailed = config.detailed,
        checks = config.tcp_checks.len(),
        "Configuration loaded"
    );

    let logger: Arc<dyn Logger> = Arc::new(TracingLogger);
    let aggregator = Arc::new(config.aggregator(Arc::clone(&logger)));

    let server = HealthServer::new(config.listen_addr.clone())
        .aggregator(aggregator)
        .error_log(logger);

    // Blocks until a shutdown signal arrives and the listener stops
    let mut completion = server.start().await?;
    completion.wait().await;

    info!("healthz service shut down");
    Ok(())
}
