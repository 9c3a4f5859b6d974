//! Mutating Admission Webhook for Pods
//!
//! Intercepts Pod create/update operations and rewrites container image
//! references according to the RegistryRewriteRule resources in the cluster.
//!
//! Routes:
//! - POST /mutate-v1-pod - AdmissionReview for Pods
//! - GET /healthz, /readyz - liveness and readiness probes

pub mod pod;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

use crate::metrics::MetricsSink;
use crate::rules::RuleCache;
use crate::{Error, MUTATE_POD_PATH};

/// Shared state for webhook handlers
pub struct WebhookState {
    /// Compiled rule cache
    pub cache: Arc<RuleCache>,
    /// Metrics sink for mutation counters and durations
    pub metrics: Arc<dyn MetricsSink>,
    /// How long a request may wait for rules before failing open
    pub store_timeout: Duration,
}

impl WebhookState {
    /// Create webhook state over a rule cache
    pub fn new(
        cache: Arc<RuleCache>,
        metrics: Arc<dyn MetricsSink>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            metrics,
            store_timeout,
        }
    }
}

/// TLS certificate and key files for the webhook listener
#[derive(Clone, Debug)]
pub struct TlsFiles {
    /// PEM certificate chain
    pub cert: PathBuf,
    /// PEM private key
    pub key: PathBuf,
}

/// Webhook server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind the server
    pub addr: SocketAddr,
    /// TLS material; plain HTTP when absent
    pub tls: Option<TlsFiles>,
}

/// Create the webhook router with the mutation endpoint and probes
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(MUTATE_POD_PATH, post(pod::mutate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .with_state(state)
}

/// Serve the webhook until the listener fails
pub async fn serve(config: ServerConfig, state: Arc<WebhookState>) -> Result<(), Error> {
    let app = webhook_router(state);

    match config.tls {
        Some(tls) => {
            let tls_config = RustlsConfig::from_pem_file(&tls.cert, &tls.key)
                .await
                .map_err(|e| Error::config(format!("TLS config error: {}", e)))?;

            info!(addr = %config.addr, "Starting webhook server (TLS)");
            axum_server::bind_rustls(config.addr, tls_config)
                .serve(app.into_make_service())
                .await
                .map_err(|e| Error::internal(format!("webhook server error: {}", e)))
        }
        None => {
            info!(addr = %config.addr, "Starting webhook server (plain HTTP)");
            axum_server::bind(config.addr)
                .serve(app.into_make_service())
                .await
                .map_err(|e| Error::internal(format!("webhook server error: {}", e)))
        }
    }
}
