use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kbind_backend::BackendOptions;
use kbind_konnector::KonnectorOptions;

#[derive(Parser, Debug)]
#[command(name = "kbind", version, about = "Service binding controllers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the provider-side controllers (service namespaces, service exports)
    Backend {
        /// Workers per controller
        #[arg(long = "workers", env = "KBIND_WORKERS", default_value_t = 2)]
        workers: usize,
    },
    /// Run the consumer-side controllers against a provider cluster
    Konnector {
        /// Kubeconfig of the provider cluster
        #[arg(long = "provider-kubeconfig")]
        provider_kubeconfig: PathBuf,
        /// Namespace the provider assigned to this consumer
        #[arg(long = "provider-namespace")]
        provider_namespace: String,
        /// Consumer secret holding the provider kubeconfig, as namespace/name
        #[arg(long = "secret-ref", default_value = "kube-bind/kubeconfig")]
        secret_ref: String,
        #[arg(long = "workers", env = "KBIND_WORKERS", default_value_t = 2)]
        workers: usize,
    },
    /// Print the kube-bind CustomResourceDefinitions as YAML
    Crds,
}

fn init_tracing() {
    let env = std::env::var("KBIND_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KBIND_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KBIND_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received; shutting down"),
            Err(e) => warn!(error = %e, "failed to listen for Ctrl-C; shutting down"),
        }
        token.cancel();
    });
}

fn print_crds() -> Result<()> {
    for crd in kbind_apis::crds() {
        let doc = serde_yaml::to_string(&crd).context("encoding CRD")?;
        println!("---\n{}", doc.trim_end());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Commands::Crds = cli.command {
        return print_crds();
    }
    init_tracing();
    init_metrics();
    metrics::counter!("kbind_starts_total", 1u64);

    let token = CancellationToken::new();
    cancel_on_ctrl_c(token.clone());

    match cli.command {
        Commands::Backend { workers } => {
            let client = kbind_kubehub::default_client().await?;
            kbind_backend::run(client, BackendOptions { workers }, token).await
        }
        Commands::Konnector { provider_kubeconfig, provider_namespace, secret_ref, workers } => {
            let opts = KonnectorOptions::new(&provider_namespace, &secret_ref, workers)
                .with_context(|| format!("invalid --secret-ref {:?}", secret_ref))?;
            let consumer = kbind_kubehub::default_client().await?;
            let provider = kbind_kubehub::client_from_kubeconfig(&provider_kubeconfig).await?;
            kbind_konnector::run(consumer, provider, opts, token).await
        }
        Commands::Crds => Ok(()),
    }
}
