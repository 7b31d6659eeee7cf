//! Build Kubernetes Operator
//!
//! This operator reconciles Build resources by creating and observing one
//! executor pod per build.
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator (requires kubeconfig)
//! build-operator
//!
//! # Run with custom log level
//! RUST_LOG=debug build-operator
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use build_operator::clients::{KubeClients, KubeEventSink};
use build_operator::strategy::{
    ExecutorPodFactory, NoopBuildPruner, NoopEnvResolver, NoopPodMutator,
};
use build_operator::watch::ClusterCaches;
use build_operator::{BuildController, BuildControllerParams};
use clap::Parser;
use kube::Client;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "build-operator")]
#[command(version, about = "Kubernetes operator driving Build resources")]
struct Args {
    /// Worker tasks per work queue
    #[arg(long, default_value_t = 5)]
    workers: usize,

    /// Namespace to watch (empty for all namespaces)
    #[arg(long, default_value = "")]
    namespace: String,

    /// Path to an additional trusted CA bundle mounted into build pods
    #[arg(long)]
    additional_trusted_ca: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();

    info!("Starting Build Kubernetes Operator");
    info!(
        "Watching namespace: {}",
        if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        }
    );

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let caches = ClusterCaches::new();
    let clients = Arc::new(KubeClients::new(client.clone()));

    let controller = BuildController::new(BuildControllerParams {
        builds: Arc::new(caches.builds.clone()),
        build_configs: Arc::new(caches.build_configs.clone()),
        pods: Arc::new(caches.pods.clone()),
        secrets: Arc::new(caches.secrets.clone()),
        image_streams: Arc::new(caches.image_streams.clone()),
        pod_client: clients.clone(),
        config_map_client: clients.clone(),
        build_patcher: clients.clone(),
        service_accounts: clients,
        events: Arc::new(KubeEventSink::new(client.clone(), "build-controller")),
        pod_factory: Arc::new(ExecutorPodFactory),
        defaults: Arc::new(NoopPodMutator),
        overrides: Arc::new(NoopPodMutator),
        env_resolver: Arc::new(NoopEnvResolver),
        pruner: Arc::new(NoopBuildPruner),
        cache_syncs: caches.cache_syncs(),
        additional_trusted_ca_path: args.additional_trusted_ca.clone(),
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let namespace = if args.namespace.is_empty() {
        None
    } else {
        Some(args.namespace.clone())
    };
    let watch_handles = caches.spawn_watches(
        client,
        namespace,
        Arc::clone(&controller),
        shutdown_rx.clone(),
    );

    let run_handle = tokio::spawn(controller.run(args.workers, shutdown_rx));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    match run_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!("Build controller error: {}", err),
        Err(err) => error!("Build controller task failed: {}", err),
    }
    for handle in watch_handles {
        let _ = handle.await;
    }

    info!("Build Operator shutting down");
    Ok(())
}
