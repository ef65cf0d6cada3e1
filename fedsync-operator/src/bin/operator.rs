//! fedsync operator binary.
//!
//! Starts one sync controller per federated kind and keeps them running until
//! interrupted.

use clap::{Parser, ValueEnum};
use fedsync_core::{AdapterRegistry, ControllerManager, SyncControllerConfig};
use fedsync_operator::crd::all_crds;
use fedsync_operator::{FederatedClusterSource, KubeConnection};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "fedsync-operator", version, about = "Multi-cluster resource sync controller")]
struct Args {
    /// Kubeconfig of the federation API server. Defaults to the inferred config.
    #[arg(long, env = "FEDSYNC_FEDERATION_KUBECONFIG")]
    federation_kubeconfig: Option<String>,

    /// Kubeconfig of the host cluster holding cluster credentials.
    #[arg(long, env = "FEDSYNC_HOST_KUBECONFIG")]
    host_kubeconfig: Option<String>,

    /// Kubeconfig of the cluster holding FederatedCluster objects.
    /// Defaults to the host cluster.
    #[arg(long, env = "FEDSYNC_CLUSTER_REGISTRY_KUBECONFIG")]
    cluster_registry_kubeconfig: Option<String>,

    /// Namespace for kubeconfig secrets that do not name one.
    #[arg(long, env = "FEDSYNC_NAMESPACE", default_value = "fedsync-system")]
    namespace: String,

    /// Federated kinds to run. Defaults to every built-in kind.
    #[arg(long = "kind", env = "FEDSYNC_KINDS", value_delimiter = ',')]
    kinds: Vec<String>,

    /// Reconcile workers per kind.
    #[arg(long, env = "FEDSYNC_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Only sync federated objects in this namespace.
    #[arg(long, env = "FEDSYNC_WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Use short delays everywhere.
    #[arg(long)]
    minimize_latency: bool,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Print the CRDs as YAML and exit.
    #[arg(long)]
    generate_crds: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.generate_crds {
        generate_crds()?;
        return Ok(());
    }

    init_tracing(args.log_format)?;
    tracing::info!("Starting fedsync operator");

    let federation =
        KubeConnection::from_path("federation", args.federation_kubeconfig.as_deref()).await?;
    let host = KubeConnection::from_path("host", args.host_kubeconfig.as_deref()).await?;
    let cluster_registry = match args.cluster_registry_kubeconfig.as_deref() {
        Some(path) => KubeConnection::from_path("cluster-registry", Some(path)).await?,
        None => host.clone(),
    };
    tracing::info!("Connected to federation and host clusters");

    let mut config = SyncControllerConfig::builder()
        .workers(args.workers)
        .minimize_latency(args.minimize_latency);
    if let Some(namespace) = &args.watch_namespace {
        config = config.namespace(namespace.clone());
    }
    let config = config.build()?;

    let adapters = AdapterRegistry::with_builtin();
    let kinds = if args.kinds.is_empty() {
        adapters.kinds()
    } else {
        args.kinds.clone()
    };

    let source = FederatedClusterSource::new(cluster_registry.client().clone(), &args.namespace);
    let manager = ControllerManager::new(
        adapters,
        Arc::new(federation),
        Arc::new(host),
        Arc::new(source),
        config,
    );

    for kind in &kinds {
        manager.start(kind)?;
        tracing::info!(kind = %kind, "Started sync controller");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    manager.shutdown().await;

    Ok(())
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("fedsync_core=info".parse()?)
        .add_directive("fedsync_operator=info".parse()?)
        .add_directive("kube=info".parse()?);

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
    Ok(())
}

/// Print CRD YAML.
fn generate_crds() -> anyhow::Result<()> {
    for crd in all_crds() {
        println!("---");
        println!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
