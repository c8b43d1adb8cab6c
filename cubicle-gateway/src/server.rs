//! Process wiring: config to stores, driver and a listening router.

use std::sync::Arc;

use cubicle_runtime::{MemoryVmStore, RuntimeDriver, SqliteVmStore, VmOrchestrator, VmStore};
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::error::StartupError;
use crate::routes::create_router;

/// Build every component from `config` and serve until Ctrl-C.
///
/// # Errors
/// Returns [`StartupError`] if the descriptor directory, record store or
/// listener cannot be set up, or the server fails.
pub async fn serve(config: GatewayConfig) -> Result<(), StartupError> {
    let settings = config.orchestrator_settings()?;
    let descriptors = config.runtime.descriptor_store();
    descriptors.ensure_dir().await?;
    info!(dir = %descriptors.dir().display(), "descriptor directory ready");

    let driver = config.runtime.driver(descriptors.clone());
    match driver.health_check().await {
        Ok(()) => info!(program = %config.runtime.program.display(), "container runtime reachable"),
        Err(e) => warn!(error = %e, "container runtime not reachable; lifecycle calls will fail until it is"),
    }

    let template = config.runtime.template();
    match config.database_url.as_deref() {
        Some(url) => {
            let store = SqliteVmStore::connect(url).await?;
            info!("using SQLite record store");
            run(&config.listen_addr, VmOrchestrator::new(store, driver, descriptors, template, settings)).await
        }
        None => {
            let store = MemoryVmStore::new();
            warn!("no database_url configured; VM records will not survive a restart");
            run(&config.listen_addr, VmOrchestrator::new(store, driver, descriptors, template, settings)).await
        }
    }
}

async fn run<S, D>(addr: &str, orchestrator: VmOrchestrator<S, D>) -> Result<(), StartupError>
where
    S: VmStore + 'static,
    D: RuntimeDriver + 'static,
{
    let app = create_router(Arc::new(orchestrator));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind { addr: addr.to_owned(), source })?;

    info!(addr = %addr, "cubicle-gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(StartupError::Serve)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
