use clipforge::api::ApiServer;
use clipforge::config::EngineConfig;
use clipforge::logging;
use clipforge::services::ServiceContainer;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = EngineConfig::from_env()?;

    let logging_handle = logging::init_logging(&config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        log_dir = ?logging_handle.log_dir(),
        "Starting clipforge"
    );

    let root_token = CancellationToken::new();
    let retention_task = logging_handle.start_retention_cleanup(root_token.child_token());

    let services = ServiceContainer::new(config.clone())?;
    services.initialize().await?;

    let server = ApiServer::new(config.server.clone(), services.app_state())
        .with_cancel_token(root_token.child_token());

    let signal_token = root_token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal_token.cancel();
    });

    let served = server.run().await;

    // The server returns once the token fires, or earlier if binding failed.
    root_token.cancel();
    services.shutdown().await;
    if let Some(task) = retention_task {
        task.abort();
    }

    served?;
    info!("clipforge stopped");
    Ok(())
}
