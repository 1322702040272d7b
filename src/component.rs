//! Cluster components
//!
//! A component is an add-on rolled out after the cluster is up: a chart plus
//! values, installed as one release. Components are applied in configured
//! order and share the install-then-upgrade path with the control plane.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cluster::KubeCluster;
use crate::config::ComponentConfig;
use crate::release::{split_rendered, ComponentRelease, HelmCli, ReleaseManager};
use crate::upgrader::ensure_release;
use crate::{Error, Result};

/// Where and how a component is deployed
#[derive(Clone, Debug, PartialEq)]
pub struct ComponentMetadata {
    pub namespace: String,
    pub release: ComponentRelease,
    pub chart: PathBuf,
}

/// An installable cluster add-on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Component: Send + Sync {
    fn metadata(&self) -> ComponentMetadata;

    /// Rendered manifests keyed by file name
    async fn render_manifests(&self) -> Result<BTreeMap<String, String>>;

    /// Install or upgrade on the cluster behind `kubeconfig`
    async fn install(&self, kubeconfig: &Path) -> Result<()>;

    /// Remove the release, and optionally its namespace
    async fn uninstall(&self, kubeconfig: &Path, delete_namespace: bool) -> Result<()>;
}

/// [`Component`] deployed from a chart on disk
pub struct ChartComponent {
    config: ComponentConfig,
    cancel: CancellationToken,
    releases: Option<Arc<dyn ReleaseManager>>,
}

impl ChartComponent {
    /// Validate a component entry and build it
    pub fn load_config(config: &ComponentConfig, cancel: CancellationToken) -> Result<Self> {
        if !config.chart.exists() {
            return Err(Error::config(format!(
                "component '{}': chart {} does not exist",
                config.name,
                config.chart.display()
            )));
        }
        Ok(Self {
            config: config.clone(),
            cancel,
            releases: None,
        })
    }

    /// Use a specific release backend instead of the helm CLI
    pub fn with_release_manager(mut self, releases: Arc<dyn ReleaseManager>) -> Self {
        self.releases = Some(releases);
        self
    }

    fn release_manager(&self, kubeconfig: Option<&Path>) -> Arc<dyn ReleaseManager> {
        if let Some(releases) = &self.releases {
            return releases.clone();
        }
        let helm = HelmCli::new(self.cancel.clone());
        match kubeconfig {
            Some(path) => Arc::new(helm.with_kubeconfig(path)),
            None => Arc::new(helm),
        }
    }

    fn release(&self) -> ComponentRelease {
        ComponentRelease::new(&self.config.name, &self.config.namespace, self.config.wait)
    }

    fn values(&self) -> Result<String> {
        if self.config.values.is_null() {
            return Ok(String::new());
        }
        serde_yaml::to_string(&self.config.values)
            .map_err(|e| Error::serialization(format!("values for {}: {}", self.config.name, e)))
    }
}

#[async_trait]
impl Component for ChartComponent {
    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata {
            namespace: self.config.namespace.clone(),
            release: self.release(),
            chart: self.config.chart.clone(),
        }
    }

    async fn render_manifests(&self) -> Result<BTreeMap<String, String>> {
        let rendered = self
            .release_manager(None)
            .template(&self.release(), &self.config.chart, &self.values()?)
            .await?;
        Ok(split_rendered(&rendered).into_iter().collect())
    }

    async fn install(&self, kubeconfig: &Path) -> Result<()> {
        let releases = self.release_manager(Some(kubeconfig));
        ensure_release(
            releases.as_ref(),
            &self.release(),
            &self.config.chart,
            &self.values()?,
        )
        .await?;
        info!(component = %self.config.name, namespace = %self.config.namespace, "component applied");
        Ok(())
    }

    async fn uninstall(&self, kubeconfig: &Path, delete_namespace: bool) -> Result<()> {
        self.release_manager(Some(kubeconfig))
            .uninstall(&self.release())
            .await?;
        if delete_namespace {
            KubeCluster::new(kubeconfig)
                .delete_namespace(&self.config.namespace)
                .await?;
        }
        info!(component = %self.config.name, "component deleted");
        Ok(())
    }
}

/// Build every selected component, failing on the first invalid one
pub fn load_components(
    configs: &[&ComponentConfig],
    cancel: &CancellationToken,
) -> Result<Vec<Box<dyn Component>>> {
    configs
        .iter()
        .map(|c| {
            ChartComponent::load_config(c, cancel.clone()).map(|c| Box::new(c) as Box<dyn Component>)
        })
        .collect()
}
