//! CLI commands

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cluster::KubeCluster;
use crate::config::{self, ClusterConfig};
use crate::executor::{Executor, ExecutorConfig, OutputSink};
use crate::orchestrator::Workflow;
use crate::platform::{self, Platform};
use crate::prompt::{FixedAnswer, Prompter, StdinPrompter};
use crate::release::HelmCli;
use crate::Result;

pub mod cluster;
pub mod component;

/// Where the configuration comes from
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Cluster configuration file
    #[arg(short, long, env = "FORGE_CONFIG", default_value = "cluster.yaml")]
    pub config: PathBuf,

    /// Values file merged over the configured component values
    #[arg(long, env = "FORGE_VALUES")]
    pub values: Option<PathBuf>,
}

impl ConfigArgs {
    pub fn load(&self) -> Result<ClusterConfig> {
        let config = config::load(&self.config, self.values.as_deref())?;
        debug!(path = %self.config.display(), components = config.components.len(), "configuration loaded");
        Ok(config)
    }
}

/// Answers prompts from stdin, or always yes when confirmed up front
pub fn prompter(confirm: bool) -> Arc<dyn Prompter> {
    if confirm {
        Arc::new(FixedAnswer(true))
    } else {
        Arc::new(StdinPrompter)
    }
}

/// One configured cluster with its platform and tool, ready for a workflow.
pub struct Session {
    pub config: ClusterConfig,
    pub platform: Box<dyn Platform>,
    pub executor: Executor,
    pub prompter: Arc<dyn Prompter>,
    pub cancel: CancellationToken,
}

impl Session {
    /// Load the configuration, build the platform and bind the tool to its
    /// asset directory.
    pub async fn open(
        args: &ConfigArgs,
        confirm: bool,
        quiet: bool,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let config = args.load()?;
        let prompter = prompter(confirm);
        let platform = platform::load_config(&config, prompter.clone())?;

        let mut executor_config = ExecutorConfig::new(platform.meta().asset_dir);
        executor_config.binary = config.tool.binary.clone();
        executor_config.version_requirement = config.tool.version_requirement.clone();
        executor_config.output = if quiet {
            OutputSink::Quiet
        } else {
            OutputSink::Stdout
        };
        executor_config.cancel = cancel.clone();
        let executor = Executor::new(executor_config).await?;

        Ok(Self {
            config,
            platform,
            executor,
            prompter,
            cancel,
        })
    }

    pub fn workflow(&self) -> Workflow<'_> {
        Workflow::new(
            self.platform.as_ref(),
            &self.executor,
            self.prompter.as_ref(),
            self.cancel.clone(),
        )
    }

    /// API access to the cluster through the platform kubeconfig
    pub fn cluster(&self) -> KubeCluster {
        KubeCluster::new(self.platform.meta().kubeconfig())
    }

    /// Release backend bound to the platform kubeconfig
    pub fn releases(&self) -> HelmCli {
        HelmCli::new(self.cancel.clone()).with_kubeconfig(self.platform.meta().kubeconfig())
    }
}
