//! HTTPS serving of the webhooks

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

use crate::error::WebhookError;
use crate::mutator::{mutate_handler, MutatorState, MUTATOR_PATH};
use crate::validator::{validate_handler, ValidatorState, VALIDATOR_PATH};

/// Certificate file inside the cert directory
pub const TLS_CERT_FILE: &str = "tls.crt";
/// Key file inside the cert directory
pub const TLS_KEY_FILE: &str = "tls.key";

/// Listener settings of a webhook server
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind
    pub addr: SocketAddr,
    /// Directory holding `tls.crt` and `tls.key`
    pub cert_dir: PathBuf,
}

/// Router of the shoot validator
pub fn validator_routes(state: Arc<ValidatorState>) -> Router {
    Router::new()
        .route(VALIDATOR_PATH, post(validate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Router of the OperatingSystemConfig mutator
pub fn mutator_routes(state: Arc<MutatorState>) -> Router {
    Router::new()
        .route(MUTATOR_PATH, post(mutate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Liveness and readiness endpoints of the controller process
pub fn health_routes() -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
}

/// Serve `app` over TLS until the server fails
pub async fn serve_tls(app: Router, config: ServerConfig) -> Result<(), WebhookError> {
    let tls_config = RustlsConfig::from_pem_file(
        config.cert_dir.join(TLS_CERT_FILE),
        config.cert_dir.join(TLS_KEY_FILE),
    )
    .await
    .map_err(|e| WebhookError::Server(format!("TLS config error: {}", e)))?;

    info!(addr = %config.addr, "Starting webhook server");

    axum_server::bind_rustls(config.addr, tls_config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))
}

/// Serve `app` over plain HTTP until the server fails
pub async fn serve_plain(app: Router, addr: SocketAddr) -> Result<(), WebhookError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| WebhookError::Server(format!("failed to bind {}: {}", addr, e)))?;
    info!(addr = %addr, "Starting health server");
    axum::serve(listener, app)
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))
}
