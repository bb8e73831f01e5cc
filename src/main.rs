mod config;
mod ipc;
mod service;
mod supervisor;
mod utils;

use std::sync::Arc;

use supervisor::ServiceManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    tracing::info!("Bridge supervisor starting");

    let cfg = config::BridgeConfig::load()?;
    let manager = Arc::new(ServiceManager::from_config(&cfg));

    // Bring up everything configured for auto-start. A failure here is
    // reported but does not take the supervisor down: the control
    // endpoint stays up so the operator can read the failing service's
    // log buffer and retry.
    if let Err(e) = manager.start_auto_managed().await {
        tracing::error!("Startup incomplete: {}", e);
    }

    // Graceful shutdown: stop every service, even if nothing started.
    let manager_shutdown = manager.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received, stopping services...");

        for (id, result) in manager_shutdown.stop_all().await {
            match result {
                Ok(()) => tracing::info!("[{}] stopped", id),
                Err(e) => tracing::error!("[{}] stop failed: {}", id, e),
            }
        }

        tracing::info!("Cleanup complete, exiting");
        std::process::exit(0);
    });

    let server = ipc::IpcServer::new(manager, &cfg.control.listen_addr);
    if let Err(e) = server.start().await {
        tracing::error!("Control endpoint error: {}", e);
    }

    tracing::info!("Bridge supervisor shutting down");
    Ok(())
}
