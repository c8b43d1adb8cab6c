//! Entry point for the `cubicle-gateway` HTTP server.

use cubicle_gateway::{serve, GatewayConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    init_logging();

    let config = match GatewayConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    if let Err(e) = serve(config).await {
        tracing::error!(error = %e, "gateway stopped");
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber from `RUST_LOG`, defaulting to `info`.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
