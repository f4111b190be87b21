//! Canopy - control-plane convergence operator for managed tenant clusters

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use canopy::command::ProcessRunner;
use canopy::controller::{error_policy, reconcile, Context};
use canopy::crd::TenantCluster;
use canopy::orchestrator::Orchestrator;
use canopy::secrets::bucket::S3ObjectStore;
use canopy::version::MissingVersionPolicy;

/// Watcher timeout (seconds) - must be less than the client read timeout so
/// the API server closes idle watches before the client times out.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Canopy - control-plane convergence operator for managed tenant clusters
#[derive(Parser, Debug)]
#[command(name = "canopy", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    Controller(ControllerArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug, Clone)]
struct ControllerArgs {
    /// Root directory holding one chart catalog per version
    #[arg(long, env = "CATALOG_ROOT", default_value = "/var/lib/canopy/catalogs")]
    catalog_root: PathBuf,

    /// Treat tenants without a version annotation as development builds
    /// instead of failing their reconcile passes
    #[arg(long)]
    default_dev_version: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&TenantCluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let args = match cli.command {
        Some(Commands::Controller(args)) => args,
        None => ControllerArgs::parse_from(["canopy"]),
    };
    run_controller(args).await
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default().await?;

    let policy = if args.default_dev_version {
        MissingVersionPolicy::DevSentinel
    } else {
        MissingVersionPolicy::Reject
    };

    let orchestrator = Orchestrator::new(
        client.clone(),
        args.catalog_root.clone(),
        policy,
        Arc::new(ProcessRunner),
        // one object-storage session for the life of the process; safe for
        // concurrent reconcile passes
        Arc::new(S3ObjectStore::new()),
    );
    let ctx = Arc::new(Context {
        client: client.clone(),
        orchestrator,
    });

    tracing::info!(
        catalog_root = %args.catalog_root.display(),
        "starting TenantCluster controller"
    );

    let tenants: Api<TenantCluster> = Api::all(client);
    Controller::new(
        tenants,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(|result| async move {
        match result {
            Ok((object, _)) => tracing::debug!(cluster = %object.name, "reconciled"),
            Err(err) => tracing::warn!(error = %err, "reconcile dispatch failed"),
        }
    })
    .await;

    Ok(())
}
