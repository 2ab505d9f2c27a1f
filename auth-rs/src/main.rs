//! auth-rs: Mail Authentication Gateway
//!
//! Answers authentication and routing lookups from the mail proxy, the MTA
//! and the delivery agent on behalf of one identity provider.

use auth_rs::backend::connect_backend;
use auth_rs::server::shutdown_signal;
use auth_rs::{GatewayConfig, GatewayServer};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "auth_rs=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting auth-rs v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("AUTH_RS_CONFIG").ok())
        .map(PathBuf::from);

    match &config_path {
        Some(path) => info!("Loading configuration from {}", path.display()),
        None => info!("No config file specified, reading AUTH_RS_* environment only"),
    }

    let config = GatewayConfig::load(config_path.as_deref())?;
    config.validate()?;

    // Refuse to start without a reachable backend
    let backend = match connect_backend(&config).await {
        Ok(backend) => backend,
        Err(e) => {
            error!("Identity backend is not usable: {}", e);
            return Err(e.into());
        }
    };

    let server = GatewayServer::new(config, backend)?;
    server.run(shutdown_signal()).await?;

    Ok(())
}
