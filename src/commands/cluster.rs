//! `forge cluster` - create, reconcile, inspect and destroy a cluster
//!
//! Usage:
//!   forge cluster apply [--confirm] [--skip-components] [--upgrade-kubelets]
//!   forge cluster destroy [--confirm]
//!   forge cluster certificate rotate [--confirm]
//!   forge cluster health

use clap::{Args, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{ConfigArgs, Session};
use crate::cluster::KubeCluster;
use crate::component::load_components;
use crate::format::print_table;
use crate::orchestrator::{
    ApplyOptions, ApplyOrchestrator, DestroyOptions, DestroyOrchestrator, RotateOptions,
    RotateOrchestrator,
};
use crate::platform;
use crate::verifier::ClusterApi;
use crate::{Error, Result};

/// Manage the cluster described by the configuration
#[derive(Args, Debug)]
pub struct ClusterArgs {
    #[command(subcommand)]
    pub command: ClusterCommand,
}

#[derive(Subcommand, Debug)]
pub enum ClusterCommand {
    /// Create the cluster, or bring an existing one up to date
    Apply(ApplyArgs),
    /// Destroy the cluster infrastructure
    Destroy(DestroyArgs),
    /// Certificate operations
    Certificate(CertificateArgs),
    /// Show node readiness and control-plane component health
    Health(HealthArgs),
}

#[derive(Args, Debug)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Apply without showing the plan or asking
    #[arg(short = 'y', long)]
    pub confirm: bool,

    /// Stop after the infrastructure and control plane
    #[arg(long)]
    pub skip_components: bool,

    /// Also upgrade the kubelet release, after the control plane
    #[arg(long)]
    pub upgrade_kubelets: bool,

    /// Only apply these components (repeatable); all of them by default
    #[arg(long = "component")]
    pub components: Vec<String>,

    /// Do not forward tool output
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Args, Debug)]
pub struct DestroyArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Destroy without asking
    #[arg(short = 'y', long)]
    pub confirm: bool,

    /// Do not forward tool output
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Args, Debug)]
pub struct CertificateArgs {
    #[command(subcommand)]
    pub command: CertificateCommand,
}

#[derive(Subcommand, Debug)]
pub enum CertificateCommand {
    /// Re-issue cluster certificates and restart the workloads that use them
    Rotate(RotateArgs),
}

#[derive(Args, Debug)]
pub struct RotateArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Rotate without asking
    #[arg(short = 'y', long)]
    pub confirm: bool,

    /// Do not forward tool output
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Args, Debug)]
pub struct HealthArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

pub async fn run(args: ClusterArgs, cancel: CancellationToken) -> Result<()> {
    match args.command {
        ClusterCommand::Apply(args) => apply(args, cancel).await,
        ClusterCommand::Destroy(args) => destroy(args, cancel).await,
        ClusterCommand::Certificate(CertificateArgs {
            command: CertificateCommand::Rotate(args),
        }) => rotate(args, cancel).await,
        ClusterCommand::Health(args) => health(args).await,
    }
}

async fn apply(args: ApplyArgs, cancel: CancellationToken) -> Result<()> {
    let session = Session::open(&args.config, args.confirm, args.quiet, cancel.clone()).await?;

    let components = if args.skip_components {
        Vec::new()
    } else {
        let selected = session.config.select_components(&args.components)?;
        load_components(&selected, &cancel)?
    };

    let cluster = session.cluster();
    let releases = session.releases();
    let options = ApplyOptions {
        confirm: args.confirm,
        skip_components: args.skip_components,
        upgrade_kubelets: args.upgrade_kubelets,
    };

    let outcome = ApplyOrchestrator::new(session.workflow(), &cluster, &cluster, &releases, components)
        .run(&options)
        .await?;
    info!(?outcome, "cluster apply finished");
    Ok(())
}

async fn destroy(args: DestroyArgs, cancel: CancellationToken) -> Result<()> {
    let session = Session::open(&args.config, args.confirm, args.quiet, cancel).await?;
    let options = DestroyOptions {
        confirm: args.confirm,
    };

    let outcome = DestroyOrchestrator::new(session.workflow())
        .run(&options)
        .await?;
    info!(?outcome, "cluster destroy finished");
    Ok(())
}

async fn rotate(args: RotateArgs, cancel: CancellationToken) -> Result<()> {
    let session = Session::open(&args.config, args.confirm, args.quiet, cancel).await?;
    let cluster = session.cluster();
    let releases = session.releases();
    let options = RotateOptions {
        confirm: args.confirm,
    };

    let outcome = RotateOrchestrator::new(session.workflow(), &releases, &cluster)
        .run(&options)
        .await?;
    info!(?outcome, "certificate rotation finished");
    Ok(())
}

/// One-shot snapshot; no waiting and no tool invocation
async fn health(args: HealthArgs) -> Result<()> {
    let config = args.config.load()?;
    let meta = platform::load_config(&config, super::prompter(false))?.meta();
    let cluster = KubeCluster::new(meta.kubeconfig());

    cluster.ping().await?;
    let nodes = cluster.node_status(meta.expected_nodes).await?;
    println!("{}\n", nodes.table());

    let components = cluster.component_statuses().await?;
    let rows: Vec<Vec<String>> = components
        .iter()
        .map(|c| {
            vec![
                c.name.clone(),
                if c.healthy { "True" } else { "False" }.to_string(),
                c.message.clone(),
            ]
        })
        .collect();
    print_table(&["NAME", "HEALTHY", "MESSAGE"], &rows);

    if !nodes.ready() {
        let ready = nodes.nodes.iter().filter(|n| n.ready).count();
        return Err(Error::validation(format!(
            "{} of {} expected nodes are ready",
            ready, meta.expected_nodes
        )));
    }
    if let Some(unhealthy) = components.iter().find(|c| !c.healthy) {
        return Err(Error::validation(format!(
            "component {} is not healthy",
            unhealthy.name
        )));
    }
    Ok(())
}
