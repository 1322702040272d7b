use std::path::Path;
use std::time::Instant;

use tracing::info;

use super::{control_plane_releases, declined, Outcome, Workflow};
use crate::cluster::kubeconfig_ca;
use crate::release::ReleaseManager;
use crate::rotator::{default_targets, CertificateRotator, RotationClient, RotationTarget, RotatorConfig};
use crate::upgrader::ControlPlaneUpgrader;
use crate::{Result, StageContext};

type CaReader = fn(&Path) -> Result<Vec<u8>>;

/// Per-invocation rotation flags
#[derive(Clone, Debug, Default)]
pub struct RotateOptions {
    /// Rotate without asking
    pub confirm: bool,
}

/// Re-issues cluster trust material and restarts everything that caches it.
pub struct RotateOrchestrator<'a> {
    workflow: Workflow<'a>,
    releases: &'a dyn ReleaseManager,
    client: &'a dyn RotationClient,
    targets: Vec<RotationTarget>,
    config: RotatorConfig,
    read_ca: CaReader,
}

impl<'a> RotateOrchestrator<'a> {
    pub fn new(
        workflow: Workflow<'a>,
        releases: &'a dyn ReleaseManager,
        client: &'a dyn RotationClient,
    ) -> Self {
        Self {
            workflow,
            releases,
            client,
            targets: default_targets(),
            config: RotatorConfig::default(),
            read_ca: kubeconfig_ca,
        }
    }

    pub fn with_targets(mut self, targets: Vec<RotationTarget>) -> Self {
        self.targets = targets;
        self
    }

    pub fn with_rotator_config(mut self, config: RotatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Where the expected CA comes from; the kubeconfig by default
    pub fn with_ca_reader(mut self, read_ca: CaReader) -> Self {
        self.read_ca = read_ca;
        self
    }

    pub async fn run(&self, options: &RotateOptions) -> Result<Outcome> {
        let start = Instant::now();
        let meta = self.workflow.platform.meta();

        self.workflow.initialize().await.stage("initialize")?;

        if !options.confirm {
            let question = format!(
                "This re-issues the cluster certificates and restarts {} control-plane workloads.",
                self.targets.len()
            );
            if !self.workflow.confirm(&question).await? {
                return Ok(declined("rotate"));
            }
        }

        println!("\n[Phase 1] Re-issuing trust material...\n");
        self.workflow
            .platform
            .rotate_certificates(self.workflow.tool)
            .await
            .stage("re-issue certificates")?;

        if meta.managed {
            info!("managed control plane, skipping control-plane upgrade");
        } else {
            println!("\n[Phase 2] Upgrading control plane...\n");
            let releases = control_plane_releases(&meta, false);
            ControlPlaneUpgrader::new(self.workflow.tool, self.releases, &meta.charts_dir)
                .upgrade(&releases)
                .await
                .stage("upgrade control plane")?;
        }

        let expected_ca = (self.read_ca)(&meta.kubeconfig()).stage("read cluster CA")?;

        println!("\n[Phase 3] Restarting workloads...\n");
        CertificateRotator::new(self.client, self.config.clone(), self.workflow.cancel.clone())
            .rotate(&expected_ca, &self.targets)
            .await
            .stage("rotate certificates")?;

        println!("\n=== Certificate rotation complete ===");
        println!("Duration: {:?}", start.elapsed());
        Ok(Outcome::Completed)
    }
}
