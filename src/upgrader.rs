//! Control-plane release upgrades
//!
//! Self-hosted control-plane components are deployed as releases whose values
//! are rendered by the infrastructure tool. On every reconciling apply each
//! release in the list is brought up to date, strictly in order.
//!
//! Order matters. Bootstrap secrets come first, the pod checkpointer before the
//! API server, the API server before the remaining control-plane workloads,
//! networking after those, and the kubelet last (and only when asked for).

use std::path::{Path, PathBuf};

use tracing::info;

use crate::executor::{self, InfraTool};
use crate::release::{ComponentRelease, ReleaseManager};
use crate::{Error, Result};

/// Namespace every control-plane release lives in
pub const CONTROL_PLANE_NAMESPACE: &str = "kube-system";

/// Releases upgraded on every reconciling apply, in upgrade order
pub const CONTROL_PLANE_RELEASES: &[&str] = &[
    "bootstrap-secrets",
    "pod-checkpointer",
    "kube-apiserver",
    "kubernetes",
    "calico",
];

/// Node agent release; only upgraded on request
pub const KUBELET_RELEASE: &str = "kubelet";

/// The control-plane release list, optionally followed by the kubelet.
pub fn default_releases(upgrade_kubelets: bool) -> Vec<ComponentRelease> {
    let mut releases: Vec<ComponentRelease> = CONTROL_PLANE_RELEASES
        .iter()
        .map(|name| ComponentRelease::new(*name, CONTROL_PLANE_NAMESPACE, true))
        .collect();
    if upgrade_kubelets {
        releases.push(ComponentRelease::new(
            KUBELET_RELEASE,
            CONTROL_PLANE_NAMESPACE,
            true,
        ));
    }
    releases
}

/// Output key holding the rendered values document for a release
pub fn values_key(release: &str) -> String {
    format!("{}_values", release.replace('-', "_"))
}

/// Fetch the rendered values document for a release and parse it.
pub async fn fetch_values(tool: &dyn InfraTool, release: &str) -> Result<serde_yaml::Value> {
    let raw: String = executor::output(tool, &values_key(release)).await?;
    serde_yaml::from_str(&raw)
        .map_err(|e| Error::serialization(format!("values for {}: {}", release, e)))
}

/// Make sure a release is installed and up to date.
///
/// A release without history is installed first. The upgrade then always
/// runs, which also repairs a release whose resources were deleted out of band.
pub async fn ensure_release(
    manager: &dyn ReleaseManager,
    release: &ComponentRelease,
    chart: &Path,
    values: &str,
) -> Result<()> {
    if manager.latest_revision(release).await?.is_none() {
        info!(release = %release.name, "release has no history, installing");
        manager.install(release, chart, values).await?;
    }
    manager.upgrade(release, chart, values).await
}

/// Walks the control-plane release list against the tool's current outputs.
pub struct ControlPlaneUpgrader<'a> {
    tool: &'a dyn InfraTool,
    releases: &'a dyn ReleaseManager,
    charts_dir: PathBuf,
}

impl<'a> ControlPlaneUpgrader<'a> {
    /// Charts are looked up as `<charts_dir>/<release name>`
    pub fn new(
        tool: &'a dyn InfraTool,
        releases: &'a dyn ReleaseManager,
        charts_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            tool,
            releases,
            charts_dir: charts_dir.into(),
        }
    }

    /// Bring each release up to date in order, stopping at the first failure.
    ///
    /// Releases upgraded before a failure stay upgraded.
    pub async fn upgrade(&self, components: &[ComponentRelease]) -> Result<()> {
        let total = components.len();
        for (i, component) in components.iter().enumerate() {
            info!(release = %component.name, "[{}/{}] upgrading control-plane release", i + 1, total);

            let chart = self.charts_dir.join(&component.name);
            let values = fetch_values(self.tool, &component.name).await?;
            let values = serde_yaml::to_string(&values)
                .map_err(|e| Error::serialization(format!("values for {}: {}", component.name, e)))?;

            ensure_release(self.releases, component, &chart, &values).await?;
        }

        info!(releases = total, "control plane up to date");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MockInfraTool;
    use crate::release::{MockReleaseManager, ReleaseRevision};
    use mockall::Sequence;
    use std::sync::{Arc, Mutex};

    fn revision() -> ReleaseRevision {
        ReleaseRevision {
            revision: 2,
            status: "deployed".to_string(),
            chart: "kube-apiserver-0.1.0".to_string(),
            app_version: "v1.31.2".to_string(),
            description: "Upgrade complete".to_string(),
        }
    }

    fn tool_with_values() -> MockInfraTool {
        let mut tool = MockInfraTool::new();
        tool.expect_output_value()
            .returning(|_| Ok(serde_json::json!("replicas: 1\n")));
        tool
    }

    // ==========================================================================
    // Story: install-then-upgrade
    // ==========================================================================

    #[tokio::test]
    async fn missing_release_is_installed_then_upgraded() {
        let mut manager = MockReleaseManager::new();
        let mut seq = Sequence::new();
        manager
            .expect_latest_revision()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        manager
            .expect_install()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        manager
            .expect_upgrade()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let release = ComponentRelease::new("calico", CONTROL_PLANE_NAMESPACE, true);
        ensure_release(&manager, &release, Path::new("/charts/calico"), "{}")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn release_with_history_is_only_upgraded() {
        let mut manager = MockReleaseManager::new();
        manager
            .expect_latest_revision()
            .returning(|_| Ok(Some(revision())));
        manager.expect_install().never();
        manager
            .expect_upgrade()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let release = ComponentRelease::new("kube-apiserver", CONTROL_PLANE_NAMESPACE, true);
        ensure_release(&manager, &release, Path::new("/charts/kube-apiserver"), "{}")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_install_skips_the_upgrade() {
        let mut manager = MockReleaseManager::new();
        manager.expect_latest_revision().returning(|_| Ok(None));
        manager
            .expect_install()
            .returning(|r, _, _| Err(Error::release(&r.name, "timed out waiting for pods")));
        manager.expect_upgrade().never();

        let release = ComponentRelease::new("calico", CONTROL_PLANE_NAMESPACE, true);
        let err = ensure_release(&manager, &release, Path::new("/charts/calico"), "{}")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("release calico"));
    }

    // ==========================================================================
    // Story: ordered control-plane sequence
    // ==========================================================================

    #[tokio::test]
    async fn releases_are_upgraded_in_listed_order() {
        let upgraded = Arc::new(Mutex::new(Vec::new()));
        let log = upgraded.clone();

        let tool = tool_with_values();
        let mut manager = MockReleaseManager::new();
        manager
            .expect_latest_revision()
            .returning(|_| Ok(Some(revision())));
        manager.expect_upgrade().returning(move |r, chart, _| {
            assert!(chart.ends_with(&r.name));
            log.lock().unwrap().push(r.name.clone());
            Ok(())
        });

        let upgrader = ControlPlaneUpgrader::new(&tool, &manager, "/charts");
        upgrader.upgrade(&default_releases(false)).await.unwrap();

        assert_eq!(
            *upgraded.lock().unwrap(),
            vec![
                "bootstrap-secrets",
                "pod-checkpointer",
                "kube-apiserver",
                "kubernetes",
                "calico"
            ]
        );
    }

    #[tokio::test]
    async fn failure_stops_later_releases() {
        let tool = tool_with_values();
        let mut manager = MockReleaseManager::new();
        manager
            .expect_latest_revision()
            .returning(|_| Ok(Some(revision())));
        manager
            .expect_upgrade()
            .with(
                mockall::predicate::function(|r: &ComponentRelease| r.name == "bootstrap-secrets"),
                mockall::predicate::always(),
                mockall::predicate::always(),
            )
            .times(1)
            .returning(|_, _, _| Ok(()));
        manager
            .expect_upgrade()
            .with(
                mockall::predicate::function(|r: &ComponentRelease| r.name == "pod-checkpointer"),
                mockall::predicate::always(),
                mockall::predicate::always(),
            )
            .times(1)
            .returning(|r, _, _| Err(Error::release(&r.name, "rollback completed")));

        let upgrader = ControlPlaneUpgrader::new(&tool, &manager, "/charts");
        let err = upgrader.upgrade(&default_releases(false)).await.unwrap_err();
        assert!(err.to_string().contains("pod-checkpointer"));
    }

    #[tokio::test]
    async fn values_are_fetched_per_release() {
        let mut tool = MockInfraTool::new();
        tool.expect_output_value()
            .withf(|key| key == "kube_apiserver_values")
            .times(1)
            .returning(|_| Ok(serde_json::json!("apiserver:\n  replicas: 2\n")));

        let mut manager = MockReleaseManager::new();
        manager
            .expect_latest_revision()
            .returning(|_| Ok(Some(revision())));
        manager
            .expect_upgrade()
            .withf(|_, _, values| values.contains("replicas: 2"))
            .returning(|_, _, _| Ok(()));

        let upgrader = ControlPlaneUpgrader::new(&tool, &manager, "/charts");
        let only_apiserver = vec![ComponentRelease::new(
            "kube-apiserver",
            CONTROL_PLANE_NAMESPACE,
            true,
        )];
        upgrader.upgrade(&only_apiserver).await.unwrap();
    }

    #[test]
    fn kubelet_is_last_and_only_on_request() {
        let without = default_releases(false);
        assert!(without.iter().all(|r| r.name != KUBELET_RELEASE));

        let with = default_releases(true);
        assert_eq!(with.len(), CONTROL_PLANE_RELEASES.len() + 1);
        assert_eq!(with.last().map(|r| r.name.as_str()), Some(KUBELET_RELEASE));
    }

    #[tokio::test]
    async fn values_document_reparses_to_the_same_map() {
        let document = "apiserver:\n  replicas: 2\n  flags:\n    - --v=2\netcd:\n  servers: [\"https://10.0.0.2:2379\"]\n";
        let mut tool = MockInfraTool::new();
        let doc = document.to_string();
        tool.expect_output_value()
            .returning(move |_| Ok(serde_json::Value::String(doc.clone())));

        let fetched = fetch_values(&tool, "kube-apiserver").await.unwrap();
        let reparsed: serde_yaml::Value =
            serde_yaml::from_str(&serde_yaml::to_string(&fetched).unwrap()).unwrap();
        let original: serde_yaml::Value = serde_yaml::from_str(document).unwrap();

        assert_eq!(fetched, original);
        assert_eq!(reparsed, original);
    }

    #[tokio::test]
    async fn malformed_values_are_rejected() {
        let mut tool = MockInfraTool::new();
        tool.expect_output_value()
            .returning(|_| Ok(serde_json::json!("key: [unterminated")));
        assert!(fetch_values(&tool, "calico").await.is_err());
    }
}
