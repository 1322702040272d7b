//! Package-deployment backend
//!
//! Releases are installed, upgraded and queried through the [`ReleaseManager`]
//! trait. The orchestration code only decides *when* to call it; the shipped
//! [`HelmCli`] implementation drives the `helm` binary, the same way the
//! infrastructure code renders charts with `helm template`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{Error, Result};

/// A release this system manages: where it lives and whether to wait on it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRelease {
    /// Release name
    pub name: String,
    /// Namespace the release is installed into
    pub namespace: String,
    /// Wait for release resources to become ready
    #[serde(default)]
    pub wait: bool,
}

impl ComponentRelease {
    /// Create a release descriptor
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, wait: bool) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            wait,
        }
    }
}

/// Most recent revision of a release
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ReleaseRevision {
    /// Revision number
    pub revision: u32,
    /// Release status (deployed, failed, superseded, ...)
    #[serde(default)]
    pub status: String,
    /// Chart name and version
    #[serde(default)]
    pub chart: String,
    /// Application version of the chart
    #[serde(default)]
    pub app_version: String,
    /// Description recorded with the revision
    #[serde(default)]
    pub description: String,
}

/// Install/upgrade/query operations on releases.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReleaseManager: Send + Sync {
    /// Most recent revision, or `None` if the release was never installed
    async fn latest_revision(&self, release: &ComponentRelease) -> Result<Option<ReleaseRevision>>;

    /// Atomic install, creating the namespace if needed
    async fn install(&self, release: &ComponentRelease, chart: &Path, values: &str) -> Result<()>;

    /// Atomic upgrade of an installed release
    async fn upgrade(&self, release: &ComponentRelease, chart: &Path, values: &str) -> Result<()>;

    /// Remove the release
    async fn uninstall(&self, release: &ComponentRelease) -> Result<()>;

    /// Render the chart locally without touching the cluster
    async fn template(&self, release: &ComponentRelease, chart: &Path, values: &str)
        -> Result<String>;
}

/// [`ReleaseManager`] backed by the `helm` CLI
#[derive(Clone, Debug)]
pub struct HelmCli {
    binary: PathBuf,
    kubeconfig: Option<PathBuf>,
    cancel: CancellationToken,
}

impl HelmCli {
    /// Create a backend; without a kubeconfig only local rendering works
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            binary: PathBuf::from("helm"),
            kubeconfig: None,
            cancel,
        }
    }

    /// Target the cluster behind `kubeconfig`
    pub fn with_kubeconfig(mut self, kubeconfig: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(kubeconfig.into());
        self
    }

    async fn run(&self, release: &ComponentRelease, args: Vec<String>) -> Result<Vec<u8>> {
        debug!(release = %release.name, args = %args.join(" "), "running helm");

        let mut command = Command::new(&self.binary);
        command.args(&args);
        if let Some(kubeconfig) = &self.kubeconfig {
            command.arg("--kubeconfig").arg(kubeconfig);
        }
        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::release(&release.name, format!("failed to run helm: {}", e)))?;

        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
        };

        if !output.status.success() {
            return Err(Error::release(
                &release.name,
                format!(
                    "helm {} failed: {}",
                    args.first().map(String::as_str).unwrap_or_default(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(output.stdout)
    }

    async fn run_with_values(
        &self,
        release: &ComponentRelease,
        values: &str,
        build: impl FnOnce(&Path) -> Vec<String>,
    ) -> Result<Vec<u8>> {
        // The file must outlive the helm process.
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}-values-", release.name))
            .suffix(".yaml")
            .tempfile()?;
        file.write_all(values.as_bytes())?;
        file.flush()?;

        self.run(release, build(file.path())).await
    }
}

#[async_trait]
impl ReleaseManager for HelmCli {
    async fn latest_revision(&self, release: &ComponentRelease) -> Result<Option<ReleaseRevision>> {
        match self.run(release, history_args(release)).await {
            Ok(stdout) => parse_history(&stdout),
            Err(Error::Release { message, .. }) if is_not_found(&message) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn install(&self, release: &ComponentRelease, chart: &Path, values: &str) -> Result<()> {
        info!(release = %release.name, namespace = %release.namespace, "installing release");
        self.run_with_values(release, values, |v| install_args(release, chart, v))
            .await
            .map(|_| ())
    }

    async fn upgrade(&self, release: &ComponentRelease, chart: &Path, values: &str) -> Result<()> {
        info!(release = %release.name, namespace = %release.namespace, "upgrading release");
        self.run_with_values(release, values, |v| upgrade_args(release, chart, v))
            .await
            .map(|_| ())
    }

    async fn uninstall(&self, release: &ComponentRelease) -> Result<()> {
        info!(release = %release.name, namespace = %release.namespace, "uninstalling release");
        let args = vec![
            "uninstall".to_string(),
            release.name.clone(),
            "--namespace".to_string(),
            release.namespace.clone(),
        ];
        self.run(release, args).await.map(|_| ())
    }

    async fn template(
        &self,
        release: &ComponentRelease,
        chart: &Path,
        values: &str,
    ) -> Result<String> {
        let stdout = self
            .run_with_values(release, values, |v| template_args(release, chart, v))
            .await?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }
}

fn history_args(release: &ComponentRelease) -> Vec<String> {
    vec![
        "history".to_string(),
        release.name.clone(),
        "--namespace".to_string(),
        release.namespace.clone(),
        "--max".to_string(),
        "1".to_string(),
        "--output".to_string(),
        "json".to_string(),
    ]
}

fn install_args(release: &ComponentRelease, chart: &Path, values: &Path) -> Vec<String> {
    let mut args = vec![
        "install".to_string(),
        release.name.clone(),
        chart.display().to_string(),
        "--namespace".to_string(),
        release.namespace.clone(),
        "--create-namespace".to_string(),
        "--atomic".to_string(),
        "--values".to_string(),
        values.display().to_string(),
    ];
    if release.wait {
        args.push("--wait".to_string());
    }
    args
}

fn upgrade_args(release: &ComponentRelease, chart: &Path, values: &Path) -> Vec<String> {
    let mut args = vec![
        "upgrade".to_string(),
        release.name.clone(),
        chart.display().to_string(),
        "--namespace".to_string(),
        release.namespace.clone(),
        "--atomic".to_string(),
        "--values".to_string(),
        values.display().to_string(),
    ];
    if release.wait {
        args.push("--wait".to_string());
    }
    args
}

fn template_args(release: &ComponentRelease, chart: &Path, values: &Path) -> Vec<String> {
    vec![
        "template".to_string(),
        release.name.clone(),
        chart.display().to_string(),
        "--namespace".to_string(),
        release.namespace.clone(),
        "--values".to_string(),
        values.display().to_string(),
    ]
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("release: not found")
}

fn parse_history(stdout: &[u8]) -> Result<Option<ReleaseRevision>> {
    let revisions: Vec<ReleaseRevision> = serde_json::from_slice(stdout)
        .map_err(|e| Error::serialization(format!("helm history: {}", e)))?;
    Ok(revisions.into_iter().max_by_key(|r| r.revision))
}

/// Split a multi-document YAML stream into `(source path, document)` pairs.
///
/// `helm template` prefixes each document with `# Source: <chart>/<path>`;
/// documents without a source comment are keyed by their position.
pub fn split_rendered(rendered: &str) -> Vec<(String, String)> {
    rendered
        .split("\n---")
        .map(|doc| doc.trim_start_matches("---").trim())
        .filter(|doc| !doc.is_empty() && doc.contains("kind:"))
        .enumerate()
        .map(|(i, doc)| {
            let source = doc
                .lines()
                .find_map(|l| l.trim().strip_prefix("# Source: "))
                .map(str::to_string)
                .unwrap_or_else(|| format!("manifest-{}.yaml", i));
            (source, format!("{}\n", doc))
        })
        .collect()
}
