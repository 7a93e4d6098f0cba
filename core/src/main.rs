/// Conversation sync daemon - Main entry point
use convsync_core::messenger_api::start_messenger_api;
use convsync_core::{ChatEngine, Config};
use std::env;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let api_addr = config.api_addr;

    let engine = ChatEngine::with_http(config)
        .map_err(|e| anyhow::anyhow!("Failed to start engine: {}", e))?;
    info!("Starting conversation sync for user {}", engine.user_id());

    // History can be fetched again later; the push channel keeps retrying
    match engine.activate().await {
        Ok(applied) => info!("Seeded {} messages from history", applied),
        Err(e) => warn!("Initial history load failed: {}", e),
    }

    let api = {
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = start_messenger_api(engine, api_addr).await {
                error!("Messenger API stopped: {}", e);
            }
        })
    };

    wait_for_shutdown().await;
    info!("Shutdown signal received, stopping...");

    api.abort();
    engine.shutdown().await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Ctrl+C received");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("SIGTERM received");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
