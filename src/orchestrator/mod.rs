//! Cluster workflows
//!
//! Each workflow is a linear sequence of stages. A stage only starts once the
//! previous one returned successfully, and every stage failure is wrapped with
//! the stage name before it is returned. Nothing is rolled back: infrastructure
//! created, releases upgraded and workloads restarted before a failure stay as
//! they are.
//!
//! - [`ApplyOrchestrator`]: create or reconcile a cluster and its components
//! - [`DestroyOrchestrator`]: tear the infrastructure down
//! - [`RotateOrchestrator`]: re-issue trust material and restart consumers
//!
//! All collaborators are borrowed trait objects, so the workflows run the
//! same against terraform and a live cluster or against mocks.

mod apply;
mod destroy;
mod rotate;

pub use apply::{apply_components, ApplyOptions, ApplyOrchestrator};
pub use destroy::{DestroyOptions, DestroyOrchestrator};
pub use rotate::{RotateOptions, RotateOrchestrator};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::executor::InfraTool;
use crate::platform::{Platform, PlatformMeta};
use crate::prompt::Prompter;
use crate::release::ComponentRelease;
use crate::upgrader::{CONTROL_PLANE_NAMESPACE, KUBELET_RELEASE};
use crate::{Result, StageContext};

/// How a workflow ended when it did not fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Every stage ran
    Completed,
    /// The operator declined a confirmation; nothing was mutated after it
    Cancelled,
}

/// Collaborators every workflow starts from
#[derive(Clone)]
pub struct Workflow<'a> {
    pub platform: &'a dyn Platform,
    pub tool: &'a dyn InfraTool,
    pub prompter: &'a dyn Prompter,
    pub cancel: CancellationToken,
}

impl<'a> Workflow<'a> {
    pub fn new(
        platform: &'a dyn Platform,
        tool: &'a dyn InfraTool,
        prompter: &'a dyn Prompter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            platform,
            tool,
            prompter,
            cancel,
        }
    }

    /// Write the infrastructure definition and initialize the tool
    async fn initialize(&self) -> Result<()> {
        let meta = self.platform.meta();
        println!("[Initialize] Preparing {}...", meta.asset_dir.display());
        self.platform.initialize().await?;
        self.tool.init().await?;
        info!(asset_dir = %meta.asset_dir.display(), "infrastructure initialized");
        Ok(())
    }

    /// Show the plan, then ask. Returns whether the operator confirmed.
    async fn plan_and_confirm(&self, question: &str) -> Result<bool> {
        println!("\n[Plan] Computing changes...\n");
        self.tool.plan().await.stage("plan")?;
        self.prompter.confirm(question).await.stage("confirm")
    }

    async fn confirm(&self, question: &str) -> Result<bool> {
        self.prompter.confirm(question).await.stage("confirm")
    }
}

/// Control-plane releases to bring up to date, kubelet last when requested
fn control_plane_releases(meta: &PlatformMeta, upgrade_kubelets: bool) -> Vec<ComponentRelease> {
    let mut releases = meta.control_plane_charts.clone();
    if upgrade_kubelets && !releases.iter().any(|r| r.name == KUBELET_RELEASE) {
        releases.push(ComponentRelease::new(
            KUBELET_RELEASE,
            CONTROL_PLANE_NAMESPACE,
            true,
        ));
    }
    releases
}

fn declined(workflow: &str) -> Outcome {
    info!(workflow, "operator declined, nothing changed");
    println!("\nAborted.");
    Outcome::Cancelled
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kubelet_is_appended_only_on_request() {
        let meta = fixtures::meta(false);
        let without = control_plane_releases(&meta, false);
        assert_eq!(without, meta.control_plane_charts);

        let with = control_plane_releases(&meta, true);
        assert_eq!(with.len(), without.len() + 1);
        assert_eq!(with.last().map(|r| r.name.as_str()), Some(KUBELET_RELEASE));
    }

    #[test]
    fn kubelet_already_listed_is_not_duplicated() {
        let mut meta = fixtures::meta(false);
        meta.control_plane_charts
            .push(ComponentRelease::new(KUBELET_RELEASE, CONTROL_PLANE_NAMESPACE, true));
        let releases = control_plane_releases(&meta, true);
        assert_eq!(
            releases.iter().filter(|r| r.name == KUBELET_RELEASE).count(),
            1
        );
    }
}
