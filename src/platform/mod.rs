//! Infrastructure platforms
//!
//! A [`Platform`] knows how to materialize a cluster with the infrastructure
//! tool: it writes the infrastructure definition into the asset directory,
//! then drives the tool to apply or destroy it. The orchestrators only see
//! this trait and the [`PlatformMeta`] it reports.
//!
//! Platforms may also offer a [`PostApplyHook`]. The capability is looked up
//! once, when an orchestrator is built.

mod hooks;
mod terraform;

pub use hooks::{ManifestDirHook, ManualStepHook};
pub use terraform::{render_backend, TerraformPlatform, BACKEND_FILE, MAIN_FILE, TFVARS_FILE};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::config::ClusterConfig;
use crate::executor::InfraTool;
use crate::prompt::Prompter;
use crate::release::ComponentRelease;
use crate::Result;

/// Kubeconfig location inside the asset directory
pub const KUBECONFIG_PATH: &str = "cluster-assets/auth/kubeconfig";

/// What the orchestrators need to know about a platform
#[derive(Clone, Debug, PartialEq)]
pub struct PlatformMeta {
    /// Working directory of the infrastructure tool
    pub asset_dir: PathBuf,
    /// Node count a ready cluster must report
    pub expected_nodes: usize,
    /// Control plane is operated by the provider and never upgraded here
    pub managed: bool,
    /// Control-plane releases in upgrade order
    pub control_plane_charts: Vec<ComponentRelease>,
    /// One chart per control-plane release, by release name
    pub charts_dir: PathBuf,
}

impl PlatformMeta {
    /// Admin kubeconfig written by the infrastructure module
    pub fn kubeconfig(&self) -> PathBuf {
        self.asset_dir.join(KUBECONFIG_PATH)
    }
}

/// Runs after the infrastructure is applied and the cluster verified.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PostApplyHook: Send + Sync {
    async fn post_apply(&self, kubeconfig: &Path) -> Result<()>;
}

/// An infrastructure platform.
///
/// Faked by hand in `orchestrator::fixtures`.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Static facts about the cluster this platform provisions
    fn meta(&self) -> PlatformMeta;

    /// Write the infrastructure definition into the asset directory
    async fn initialize(&self) -> Result<()>;

    /// Create or update the infrastructure
    async fn apply(&self, tool: &dyn InfraTool) -> Result<()>;

    /// Tear the infrastructure down
    async fn destroy(&self, tool: &dyn InfraTool) -> Result<()>;

    /// Replace the resources holding the cluster's trust material so the
    /// CA and every certificate signed by it are issued anew
    async fn rotate_certificates(&self, tool: &dyn InfraTool) -> Result<()>;

    /// Optional post-apply capability
    fn post_apply_hook(&self) -> Option<Arc<dyn PostApplyHook>>;
}

/// Build the platform a configuration describes.
///
/// The configuration has already been validated; `prompter` answers the
/// manual-step question if the platform has one.
pub fn load_config(config: &ClusterConfig, prompter: Arc<dyn Prompter>) -> Result<Box<dyn Platform>> {
    Ok(Box::new(TerraformPlatform::from_config(config, prompter)?))
}
