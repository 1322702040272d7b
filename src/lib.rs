//! cluster-forge - Kubernetes cluster provisioning orchestration
//!
//! Drives terraform to provision a cluster, verifies it, keeps its self-hosted
//! control plane up to date, rotates its certificates and rolls out add-on
//! components.
//!
//! # Modules
//!
//! - [`executor`] - Supervised infrastructure tool invocations
//! - [`orchestrator`] - Apply, destroy and certificate-rotation workflows
//! - [`verifier`] - Cluster readiness polling
//! - [`upgrader`] - Ordered control-plane release upgrades
//! - [`rotator`] - Workload restarts after a CA change
//! - [`platform`] - Infrastructure definitions the tool applies
//! - [`component`] - Chart-based cluster add-ons
//! - [`release`] - Release management backend (helm)
//! - [`cluster`] - Kubernetes API access
//! - [`config`] - Cluster configuration file
//! - [`commands`] - CLI subcommands

pub mod cluster;
pub mod commands;
pub mod component;
pub mod config;
pub mod error;
pub mod executor;
pub mod format;
pub mod orchestrator;
pub mod platform;
pub mod prompt;
pub mod release;
pub mod retry;
pub mod rotator;
pub mod telemetry;
pub mod upgrader;
pub mod verifier;

pub use error::{Error, StageContext};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use telemetry::LogFormat;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "cluster-forge";

/// Label every namespace carries, set to the namespace's own name
pub const NAMESPACE_NAME_LABEL: &str = "clusterforge.io/name";

/// cluster-forge - provision and operate Kubernetes clusters
#[derive(Parser, Debug)]
#[command(name = "forge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text, env = "FORGE_LOG_FORMAT")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create, reconcile, inspect and destroy the cluster
    Cluster(commands::cluster::ClusterArgs),
    /// Manage add-on components
    Component(commands::component::ComponentArgs),
}

impl Cli {
    /// Logging settings requested on the command line
    pub fn log_config(&self) -> telemetry::LogConfig {
        telemetry::LogConfig {
            verbose: self.verbose,
            format: self.log_format,
        }
    }

    /// Run the CLI command
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        match self.command {
            Commands::Cluster(args) => commands::cluster::run(args, cancel).await,
            Commands::Component(args) => commands::component::run(args, cancel).await,
        }
    }
}
