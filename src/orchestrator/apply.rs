use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use super::{control_plane_releases, declined, Outcome, Workflow};
use crate::cluster::NamespaceLabeler;
use crate::component::Component;
use crate::executor::cluster_exists;
use crate::platform::{PlatformMeta, PostApplyHook};
use crate::release::ReleaseManager;
use crate::upgrader::ControlPlaneUpgrader;
use crate::verifier::{ClusterApi, ReadinessVerifier, VerifierConfig};
use crate::{Error, Result, StageContext};

/// Per-invocation apply flags
#[derive(Clone, Debug, Default)]
pub struct ApplyOptions {
    /// Skip the plan and prompt on an existing cluster
    pub confirm: bool,
    /// Stop after the infrastructure and control plane
    pub skip_components: bool,
    /// Include the kubelet release in the control-plane upgrade
    pub upgrade_kubelets: bool,
}

/// Creates a cluster, or reconciles an existing one, then rolls out components.
pub struct ApplyOrchestrator<'a> {
    workflow: Workflow<'a>,
    cluster: &'a dyn ClusterApi,
    labeler: &'a dyn NamespaceLabeler,
    releases: &'a dyn ReleaseManager,
    components: Vec<Box<dyn Component>>,
    post_apply: Option<Arc<dyn PostApplyHook>>,
    verifier: VerifierConfig,
}

impl<'a> ApplyOrchestrator<'a> {
    /// `components` are applied in the given order.
    pub fn new(
        workflow: Workflow<'a>,
        cluster: &'a dyn ClusterApi,
        labeler: &'a dyn NamespaceLabeler,
        releases: &'a dyn ReleaseManager,
        components: Vec<Box<dyn Component>>,
    ) -> Self {
        let post_apply = workflow.platform.post_apply_hook();
        Self {
            workflow,
            cluster,
            labeler,
            releases,
            components,
            post_apply,
            verifier: VerifierConfig::default(),
        }
    }

    pub fn with_verifier_config(mut self, verifier: VerifierConfig) -> Self {
        self.verifier = verifier;
        self
    }

    pub async fn run(&self, options: &ApplyOptions) -> Result<Outcome> {
        let start = Instant::now();
        let meta = self.workflow.platform.meta();

        self.workflow.initialize().await.stage("initialize")?;

        let existed = cluster_exists(self.workflow.tool)
            .await
            .stage("check existence")?;
        info!(existed, "checked for an existing cluster");

        if existed && !options.confirm {
            let confirmed = self
                .workflow
                .plan_and_confirm("The cluster already exists. Apply the changes above?")
                .await?;
            if !confirmed {
                return Ok(declined("apply"));
            }
        }

        println!("\n[Phase 1] Applying infrastructure...\n");
        match self.workflow.platform.apply(self.workflow.tool).await {
            Err(e) if e.is_declined() => return Ok(declined("apply")),
            applied => applied.stage("apply infrastructure")?,
        }

        println!("\n[Phase 2] Verifying cluster ({} nodes)...\n", meta.expected_nodes);
        ReadinessVerifier::new(self.cluster, self.verifier.clone(), self.workflow.cancel.clone())
            .verify(meta.expected_nodes)
            .await
            .stage("verify cluster")?;

        println!("[Phase 3] Labeling namespaces...");
        let labeled = self
            .labeler
            .label_namespaces()
            .await
            .stage("normalize namespaces")?;
        println!("  {} namespace(s) labeled", labeled);

        if existed && !meta.managed {
            println!("\n[Phase 4] Upgrading control plane...\n");
            self.upgrade_control_plane(&meta, options.upgrade_kubelets)
                .await
                .stage("upgrade control plane")?;
        } else {
            info!(fresh = !existed, managed = meta.managed, "skipping control-plane upgrade");
        }

        if let Some(hook) = &self.post_apply {
            println!("\n[Phase 5] Running post-apply hook...\n");
            hook.post_apply(&meta.kubeconfig())
                .await
                .stage("post-apply hook")?;
        }

        if options.skip_components {
            info!("skipping components");
        } else if !self.components.is_empty() {
            println!("\n[Phase 6] Applying components...\n");
            apply_components(&self.components, &meta.kubeconfig())
                .await
                .stage("apply components")?;
        }

        println!("\n=== Apply complete ===");
        println!("Duration: {:?}", start.elapsed());
        println!("Kubeconfig: {}", meta.kubeconfig().display());
        Ok(Outcome::Completed)
    }

    async fn upgrade_control_plane(&self, meta: &PlatformMeta, upgrade_kubelets: bool) -> Result<()> {
        let releases = control_plane_releases(meta, upgrade_kubelets);
        ControlPlaneUpgrader::new(self.workflow.tool, self.releases, &meta.charts_dir)
            .upgrade(&releases)
            .await
    }
}

/// Install components strictly in order; the first failure stops the rest.
pub async fn apply_components(components: &[Box<dyn Component>], kubeconfig: &Path) -> Result<()> {
    let total = components.len();
    for (i, component) in components.iter().enumerate() {
        let name = component.metadata().release.name;
        println!("  [{}/{}] {}", i + 1, total, name);
        component
            .install(kubeconfig)
            .await
            .map_err(|e| Error::in_release(name.clone(), e))?;
    }
    info!(components = total, "components applied");
    Ok(())
}
