//! Registry cache extension
//!
//! `controller` runs in the seed: it reconciles registry-cache Extensions and
//! serves the OperatingSystemConfig mutator. `admission` runs next to the
//! garden API server and serves the Shoot validator.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

use registry_cache_common::kube_utils::create_client;
use registry_cache_common::leader_election::{LeaderElector, LeaseTiming};
use registry_cache_common::telemetry::{init_telemetry, LogFormat, LogLevel, TelemetryConfig};
use registry_cache_controller::cleaner::CleanerImages;
use registry_cache_controller::{controller, Context, ControllerConfig};
use registry_cache_webhook::server::{
    health_routes, mutator_routes, serve_plain, serve_tls, validator_routes, ServerConfig,
};
use registry_cache_webhook::{KubeReader, MutatorState, ValidatorState};

const SERVICE_NAME: &str = "gardener-extension-registry-cache";

/// Pull-through registry caches for shoot clusters
#[derive(Parser, Debug)]
#[command(name = "gardener-extension-registry-cache", version, about, long_about = None)]
struct Cli {
    /// OTLP endpoint for traces and metrics; logs only when unset
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT", global = true)]
    otlp_endpoint: Option<String>,

    /// Log line format: json or text
    #[arg(long, default_value_t = LogFormat::Json, global = true)]
    log_format: LogFormat,

    /// Log verbosity: debug, info or error
    #[arg(long, default_value_t = LogLevel::Info, global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile Extensions and mutate OperatingSystemConfigs in the seed
    Controller(ControllerArgs),
    /// Validate Shoots in the garden cluster
    Admission(AdmissionArgs),
}

#[derive(Args, Debug)]
struct WebhookArgs {
    /// Port of the HTTPS webhook server
    #[arg(long, default_value_t = 10250)]
    webhook_port: u16,

    /// Directory holding tls.crt and tls.key
    #[arg(long, env = "WEBHOOK_CERT_DIR", default_value = "/etc/gardener-extension-registry-cache/webhook-certs")]
    webhook_cert_dir: PathBuf,
}

impl WebhookArgs {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            addr: SocketAddr::from(([0, 0, 0, 0], self.webhook_port)),
            cert_dir: self.webhook_cert_dir.clone(),
        }
    }
}

#[derive(Args, Debug)]
struct ControllerArgs {
    /// Extensions reconciled in parallel
    #[arg(long, default_value_t = 5)]
    max_concurrent_reconciles: u16,

    /// Only run the controller while holding the leader lease
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    leader_election: bool,

    /// Namespace of the leader lease
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE", default_value = "garden")]
    leader_election_namespace: String,

    /// Name of the leader lease
    #[arg(long, default_value = "gardener-extension-registry-cache-leader-election")]
    leader_election_id: String,

    /// Image of the cache workloads
    #[arg(long, env = "REGISTRY_IMAGE")]
    registry_image: String,

    /// Image running the node configuration cleanup
    #[arg(long, env = "CLEANER_IMAGE")]
    cleaner_image: String,

    /// Image parking cleaner pods
    #[arg(long, env = "PAUSE_IMAGE")]
    pause_image: String,

    /// Only handle Extensions of this class
    #[arg(long, env = "EXTENSION_CLASS")]
    extension_class: Option<String>,

    /// Port of the plain HTTP health server
    #[arg(long, default_value_t = 8081)]
    healthz_port: u16,

    #[command(flatten)]
    webhook: WebhookArgs,
}

impl ControllerArgs {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            registry_image: self.registry_image.clone(),
            cleaner_images: CleanerImages {
                cleaner: self.cleaner_image.clone(),
                pause: self.pause_image.clone(),
            },
            extension_class: self.extension_class.clone(),
        }
    }
}

#[derive(Args, Debug)]
struct AdmissionArgs {
    #[command(flatten)]
    webhook: WebhookArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_telemetry(
        TelemetryConfig::new(SERVICE_NAME, cli.otlp_endpoint.clone())
            .with_logging(cli.log_format, cli.log_level),
    )?;

    match cli.command {
        Commands::Controller(args) => run_controller(args).await,
        Commands::Admission(args) => run_admission(args).await,
    }
}

/// Leader election identity: the pod name, else the hostname
fn identity() -> String {
    std::env::var("POD_NAME")
        .ok()
        .filter(|n| !n.is_empty())
        .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
        .unwrap_or_else(|| SERVICE_NAME.to_string())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = create_client().await?;
    let ctx = Arc::new(Context::new(client.clone(), args.controller_config()));

    // Every replica serves the mutator; only the leader reconciles.
    let mutator = mutator_routes(Arc::new(MutatorState {
        seed: Arc::new(KubeReader::new(client.clone())),
    }));
    let webhook_server = tokio::spawn(serve_tls(mutator, args.webhook.server_config()));
    let health_server = tokio::spawn(serve_plain(
        health_routes(),
        SocketAddr::from(([0, 0, 0, 0], args.healthz_port)),
    ));

    let result = if args.leader_election {
        let identity = identity();
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            &args.leader_election_id,
            &args.leader_election_namespace,
            &identity,
            LeaseTiming::default(),
        ));
        let mut guard = tokio::select! {
            guard = elector.acquire() => guard,
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal before acquiring leadership");
                webhook_server.abort();
                health_server.abort();
                return Ok(());
            }
        };
        info!(%identity, "Acquired leadership, starting controller");

        let result = tokio::select! {
            _ = controller::run(client, ctx, args.max_concurrent_reconciles) => {
                info!("Extension controller completed");
                Ok(())
            }
            _ = guard.lost() => {
                error!("Lost leadership, exiting");
                Err(anyhow::anyhow!("lost leadership"))
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                Ok(())
            }
        };
        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release leader lease");
        }
        result
    } else {
        tokio::select! {
            _ = controller::run(client, ctx, args.max_concurrent_reconciles) => {
                info!("Extension controller completed");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
            }
        }
        Ok(())
    };

    webhook_server.abort();
    health_server.abort();
    info!("Registry cache controller shutting down");
    result
}

async fn run_admission(args: AdmissionArgs) -> anyhow::Result<()> {
    let client = create_client().await?;
    let validator = validator_routes(Arc::new(ValidatorState {
        secrets: Arc::new(KubeReader::new(client)),
    }));

    tokio::select! {
        result = serve_tls(validator, args.webhook.server_config()) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }
    info!("Registry cache admission shutting down");
    Ok(())
}
