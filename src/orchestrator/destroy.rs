use std::time::Instant;

use tracing::info;

use super::{declined, Outcome, Workflow};
use crate::executor::cluster_exists;
use crate::{Result, StageContext};

/// Per-invocation destroy flags
#[derive(Clone, Debug, Default)]
pub struct DestroyOptions {
    /// Destroy without asking
    pub confirm: bool,
}

/// Tears down the infrastructure behind a cluster.
pub struct DestroyOrchestrator<'a> {
    workflow: Workflow<'a>,
}

impl<'a> DestroyOrchestrator<'a> {
    pub fn new(workflow: Workflow<'a>) -> Self {
        Self { workflow }
    }

    pub async fn run(&self, options: &DestroyOptions) -> Result<Outcome> {
        let start = Instant::now();
        let meta = self.workflow.platform.meta();

        self.workflow.initialize().await.stage("initialize")?;

        let exists = cluster_exists(self.workflow.tool)
            .await
            .stage("check existence")?;
        if !exists {
            info!(asset_dir = %meta.asset_dir.display(), "no cluster state found");
            println!("\nNothing to destroy.");
            return Ok(Outcome::Completed);
        }

        if !options.confirm {
            let question = format!(
                "This destroys the cluster in {} and everything running on it.",
                meta.asset_dir.display()
            );
            if !self.workflow.confirm(&question).await? {
                return Ok(declined("destroy"));
            }
        }

        println!("\n[Destroy] Destroying infrastructure...\n");
        self.workflow
            .platform
            .destroy(self.workflow.tool)
            .await
            .stage("destroy infrastructure")?;

        println!("\n=== Destroy complete ===");
        println!("Duration: {:?}", start.elapsed());
        Ok(Outcome::Completed)
    }
}
