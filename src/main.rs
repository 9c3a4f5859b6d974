//! Registry Rewriter - mutating admission webhook for Pod container images

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser};
use kube::Client;

use registry_rewriter::controller::{
    build_invalidation_watcher, build_rule_controller, Context, KubeRuleStatusClient,
};
use registry_rewriter::metrics::{MetricsSink, OtelMetrics};
use registry_rewriter::rules::{KubeRuleStore, RuleCache};
use registry_rewriter::startup::{crd_yaml, ensure_crd_installed};
use registry_rewriter::telemetry::{init_telemetry, TelemetryConfig};
use registry_rewriter::webhook::{self, ServerConfig, TlsFiles, WebhookState};
use registry_rewriter::{DEFAULT_LISTEN_ADDR, DEFAULT_STORE_TIMEOUT_MS};

/// Registry Rewriter - rewrites Pod container images using RegistryRewriteRule resources
#[derive(Parser, Debug)]
#[command(name = "registry-rewriter", version, about, long_about = None)]
struct Cli {
    /// Print the RegistryRewriteRule CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    serve: ServeArgs,
}

/// Webhook server and controller arguments
#[derive(Args, Debug)]
struct ServeArgs {
    /// Address the webhook listens on
    #[arg(long, env = "REWRITER_LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    listen_addr: SocketAddr,

    /// PEM certificate chain; plain HTTP when neither TLS flag is set
    #[arg(long, env = "REWRITER_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, env = "REWRITER_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Milliseconds a request may wait for rules before admitting the Pod unchanged
    #[arg(long, env = "REWRITER_STORE_TIMEOUT_MS", default_value_t = DEFAULT_STORE_TIMEOUT_MS)]
    store_timeout_ms: u64,

    /// Install or update the RegistryRewriteRule CRD on startup
    #[arg(long, env = "REWRITER_INSTALL_CRD")]
    install_crd: bool,
}

impl ServeArgs {
    fn server_config(&self) -> ServerConfig {
        let tls = match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some(TlsFiles {
                cert: cert.clone(),
                key: key.clone(),
            }),
            _ => None,
        };
        ServerConfig {
            addr: self.listen_addr,
            tls,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider before any TLS config is built
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_yaml()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    run_serve(cli.serve).await
}

/// Run the webhook server, rule controller and invalidation watcher
async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    tracing::info!(
        listen_addr = %args.listen_addr,
        tls = args.tls_cert.is_some(),
        store_timeout_ms = args.store_timeout_ms,
        "Starting registry rewriter"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if args.install_crd {
        ensure_crd_installed(&client).await?;
    }

    let metrics: Arc<dyn MetricsSink> = Arc::new(OtelMetrics);
    let cache = Arc::new(RuleCache::new(
        Arc::new(KubeRuleStore::new(client.clone())),
        metrics.clone(),
    ));

    let state = Arc::new(WebhookState::new(
        cache.clone(),
        metrics,
        Duration::from_millis(args.store_timeout_ms),
    ));
    let ctx = Arc::new(Context::new(
        cache.clone(),
        Arc::new(KubeRuleStatusClient::new(client.clone())),
    ));

    tracing::info!("Starting controllers:");
    let controller = build_rule_controller(client.clone(), ctx);
    let watcher = build_invalidation_watcher(client, cache);
    let server = webhook::serve(args.server_config(), state);

    tokio::select! {
        result = server => {
            result?;
            tracing::info!("Webhook server completed");
        }
        _ = controller => {
            tracing::info!("RegistryRewriteRule controller completed");
        }
        _ = watcher => {
            tracing::info!("RegistryRewriteRule watcher completed");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    tracing::info!("Registry rewriter shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_defaults() {
        let args = Cli::try_parse_from(["registry-rewriter"]).unwrap().serve;
        assert_eq!(args.listen_addr.port(), 9443);
        assert_eq!(args.store_timeout_ms, 5000);
        assert!(!args.install_crd);
        assert!(args.server_config().tls.is_none());
    }

    #[test]
    fn test_tls_flags_must_be_paired() {
        let result = Cli::try_parse_from([
            "registry-rewriter",
            "--tls-cert",
            "/etc/webhook/tls.crt",
        ]);
        assert!(result.is_err());

        let args = Cli::try_parse_from([
            "registry-rewriter",
            "--tls-cert",
            "/etc/webhook/tls.crt",
            "--tls-key",
            "/etc/webhook/tls.key",
            "--store-timeout-ms",
            "250",
        ])
        .unwrap()
        .serve;
        let config = args.server_config();
        assert_eq!(args.store_timeout_ms, 250);
        assert_eq!(
            config.tls.map(|t| t.key),
            Some(PathBuf::from("/etc/webhook/tls.key"))
        );
    }
}
