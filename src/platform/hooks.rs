use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::PostApplyHook;
use crate::cluster::KubeCluster;
use crate::executor::StepHook;
use crate::prompt::Prompter;
use crate::release::split_rendered;
use crate::{Error, Result};

/// Stops before a step until the operator confirms a manual action.
pub struct ManualStepHook {
    message: String,
    prompter: Arc<dyn Prompter>,
}

impl ManualStepHook {
    pub fn new(message: impl Into<String>, prompter: Arc<dyn Prompter>) -> Self {
        Self {
            message: message.into(),
            prompter,
        }
    }
}

#[async_trait]
impl StepHook for ManualStepHook {
    async fn before(&self, step: &str) -> Result<()> {
        let question = format!("{}\n\nBefore '{}': has this been done?", self.message, step);
        if self.prompter.confirm(&question).await? {
            Ok(())
        } else {
            info!(step, "manual step not confirmed, stopping");
            Err(Error::declined(step))
        }
    }
}

/// Applies every YAML file in a directory to the new cluster.
#[derive(Clone, Debug)]
pub struct ManifestDirHook {
    dir: PathBuf,
}

impl ManifestDirHook {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Documents from `*.yaml` / `*.yml` files, files in name order
    pub fn documents(&self) -> Result<Vec<String>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .map_err(|e| Error::config(format!("failed to read {}: {}", self.dir.display(), e)))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && matches!(
                        p.extension().and_then(|e| e.to_str()),
                        Some("yaml") | Some("yml")
                    )
            })
            .collect();
        files.sort();

        let mut documents = Vec::new();
        for file in files {
            let content = std::fs::read_to_string(&file)?;
            documents.extend(split_rendered(&content).into_iter().map(|(_, doc)| doc));
        }
        Ok(documents)
    }
}

#[async_trait]
impl PostApplyHook for ManifestDirHook {
    async fn post_apply(&self, kubeconfig: &Path) -> Result<()> {
        let documents = self.documents()?;
        if documents.is_empty() {
            return Ok(());
        }
        let applied = KubeCluster::new(kubeconfig).apply_manifests(&documents).await?;
        info!(applied, dir = %self.dir.display(), "applied post-apply manifests");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::MockPrompter;

    #[tokio::test]
    async fn confirmed_manual_step_continues() {
        let mut prompter = MockPrompter::new();
        prompter
            .expect_confirm()
            .withf(|q| q.contains("Create the DNS records") && q.contains("create infrastructure"))
            .returning(|_| Ok(true));

        let hook = ManualStepHook::new("Create the DNS records", Arc::new(prompter));
        hook.before("create infrastructure").await.unwrap();
    }

    #[tokio::test]
    async fn declined_manual_step_stops_without_cancelling() {
        let mut prompter = MockPrompter::new();
        prompter.expect_confirm().returning(|_| Ok(false));

        let hook = ManualStepHook::new("Create the DNS records", Arc::new(prompter));
        let err = hook.before("create infrastructure").await.unwrap_err();
        assert!(matches!(err, Error::Declined { ref step } if step == "create infrastructure"));
        assert!(!err.is_cancelled());
    }

    #[test]
    fn manifest_documents_come_from_yaml_files_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("20-app.yaml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: app\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("10-ns.yml"),
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: b\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "kind: ignored").unwrap();

        let docs = ManifestDirHook::new(dir.path()).documents().unwrap();
        assert_eq!(docs.len(), 3);
        assert!(docs[0].contains("name: a"));
        assert!(docs[2].contains("kind: ConfigMap"));
    }

    #[test]
    fn missing_manifest_dir_is_a_config_error() {
        let hook = ManifestDirHook::new("/definitely/not/here");
        assert!(matches!(hook.documents(), Err(Error::Config(_))));
    }
}
