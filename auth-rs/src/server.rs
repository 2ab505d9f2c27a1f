//! HTTP lookup server

use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::backend::BackendCapability;
use crate::config::GatewayConfig;
use crate::delivery::{self, DeliveryLookupAdapter};
use crate::error::Result;
use crate::inbound::{self, InboundAuthAdapter};
use crate::srs::SenderRewriter;
use crate::transport::{self, TransportLookupAdapter};
use crate::upstream::UpstreamTable;

/// Shared gateway state
///
/// Every adapter holds the same backend; none of them keeps per-request
/// state, so lookups run fully in parallel.
pub struct AppState {
    pub inbound: InboundAuthAdapter,
    pub transport: TransportLookupAdapter,
    pub delivery: DeliveryLookupAdapter,
}

impl AppState {
    pub fn new(config: &GatewayConfig, backend: Arc<dyn BackendCapability>) -> Result<Self> {
        let srs = SenderRewriter::from_config(&config.srs)?;

        Ok(Self {
            inbound: InboundAuthAdapter::new(
                backend.clone(),
                UpstreamTable::new(&config.upstream),
            ),
            transport: TransportLookupAdapter::new(
                backend.clone(),
                srs,
                config.lookup.alias_empty_is_not_found,
            ),
            delivery: DeliveryLookupAdapter::new(backend, config.mail.allow_nets.clone()),
        })
    }
}

/// Gateway server
pub struct GatewayServer {
    config: GatewayConfig,
    state: Arc<AppState>,
    backend: Arc<dyn BackendCapability>,
}

impl GatewayServer {
    /// Create a new gateway server around an already probed backend
    pub fn new(config: GatewayConfig, backend: Arc<dyn BackendCapability>) -> Result<Self> {
        config.validate()?;
        let state = Arc::new(AppState::new(&config, backend.clone())?);

        Ok(Self {
            config,
            state,
            backend,
        })
    }

    /// Build the Axum router
    pub fn router(&self) -> Router {
        build_router(
            self.state.clone(),
            Duration::from_secs(self.config.server.timeout_seconds),
        )
    }

    /// Serve until `shutdown` resolves, then close the backend
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.config.listen_addr()?;
        let router = self.router();

        info!("Starting auth gateway on {}", addr);
        info!("Backend: {}", self.backend.name());
        info!("Mail domains: {}", self.config.mail.domains.join(", "));

        let listener = TcpListener::bind(addr).await?;
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await;

        // In-flight lookups have finished once serve returns
        self.backend.close().await;
        info!("Auth gateway stopped");

        served?;
        Ok(())
    }
}

/// Routes for all three mail components
pub fn build_router(state: Arc<AppState>, timeout: Duration) -> Router {
    let transport_routes = Router::new()
        .route("/domain/*domain", get(transport::domain_handler))
        .route("/mailbox/*email", get(transport::mailbox_handler))
        .route("/alias/*alias", get(transport::alias_handler))
        .route("/transport/*email", get(transport::transport_handler))
        .route("/recipient/*recipient", get(transport::recipient_handler))
        .route("/sender/*sender", get(transport::sender_handler))
        .route("/login/*sender", get(transport::sender_login_handler))
        .route("/access/*sender", get(transport::sender_access_handler));

    let delivery_routes = Router::new()
        .route("/passdb/*user", get(delivery::passdb_handler))
        .route("/userdb/*user", get(delivery::userdb_handler))
        .route("/quota/:namespace/*user", post(delivery::quota_handler))
        .route("/sieve/name/:script/*user", get(delivery::sieve_name_handler))
        .route("/sieve/data/:script/*user", get(delivery::sieve_data_handler));

    Router::new()
        .route("/health", get(health_endpoint))
        .route("/internal/auth", get(inbound::auth_handler))
        .nest("/internal/transport", transport_routes)
        .nest("/internal/delivery", delivery_routes)
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_endpoint() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
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

    info!("Shutdown signal received");
}
