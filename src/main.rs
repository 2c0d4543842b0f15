use anyhow::Context;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audit_ledger::api::create_router;
use audit_ledger::config::AppConfig;
use audit_ledger::LedgerService;

const POLICY_RELOAD_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audit_ledger=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting audit ledger service");

    let config = AppConfig::load().context("Failed to load configuration")?;
    info!("Configuration loaded");

    let service = Arc::new(
        LedgerService::from_config(&config).context("Failed to initialize ledger service")?,
    );
    info!("Ledger opened at {:?}", config.ledger_path);

    // Policy hot reload task
    if config.policy_auto_reload && config.policy_dir.is_some() {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLICY_RELOAD_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = service.reload_policies_if_changed() {
                    error!("Failed to reload ledger policies: {}", e);
                }
            }
        });
        info!("Policy reload watcher started");
    }

    let app = create_router(Arc::clone(&service));

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.close().await.context("Failed to close ledger")?;
    info!("Ledger closed");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
