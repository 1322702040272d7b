//! Cluster configuration file
//!
//! One YAML document describes a cluster: where its assets live, which
//! platform provisions it, where the infrastructure state is kept, which
//! tool version is acceptable and which components to roll out.
//!
//! ```yaml
//! cluster:
//!   assetDir: ./assets
//!   platform:
//!     kind: terraform
//!     modulePath: ./modules/bare-metal
//!     expectedNodes: 3
//!     variables:
//!       cluster_name: forge
//!   backend:
//!     type: s3
//!     bucket: forge-state
//!     key: clusters/forge.tfstate
//!     region: eu-central-1
//! components:
//!   - name: cert-manager
//!     chart: ./charts/cert-manager
//!     namespace: cert-manager
//!     wait: true
//! ```
//!
//! Relative paths are resolved against the directory of the config file.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::executor::version::DEFAULT_VERSION_REQUIREMENT;
use crate::release::ComponentRelease;
use crate::{Error, Result};

/// Default asset directory, relative to the config file
pub const DEFAULT_ASSET_DIR: &str = "assets";

/// Root of the cluster configuration file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClusterConfig {
    /// Cluster, platform and backend
    pub cluster: ClusterSection,
    /// Infrastructure tool settings
    #[serde(default)]
    pub tool: ToolConfig,
    /// Components in rollout order
    #[serde(default)]
    pub components: Vec<ComponentConfig>,
}

/// The `cluster` block
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClusterSection {
    /// Working directory for the infrastructure tool
    #[serde(default = "default_asset_dir")]
    pub asset_dir: PathBuf,
    pub platform: PlatformConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

fn default_asset_dir() -> PathBuf {
    PathBuf::from(DEFAULT_ASSET_DIR)
}

/// Whether the platform hosts its own control plane
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    /// Self-hosted control plane, provisioned by a module
    Terraform,
    /// Control plane operated by the cloud provider
    Managed,
}

/// The `cluster.platform` block
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PlatformConfig {
    pub kind: PlatformKind,
    /// Module that provisions the cluster
    pub module_path: PathBuf,
    /// Nodes the cluster must have before it counts as ready
    pub expected_nodes: usize,
    /// Input variables passed to the module
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
    /// Replaces the built-in control-plane release list
    #[serde(default)]
    pub control_plane_charts: Option<Vec<ComponentRelease>>,
    /// Directory holding one chart per control-plane release
    #[serde(default)]
    pub charts_dir: Option<PathBuf>,
    /// Manifests applied once the cluster is up
    #[serde(default)]
    pub post_apply_manifests: Option<PathBuf>,
    /// Shown before applying; the operator has to confirm it was done
    #[serde(default)]
    pub manual_step_message: Option<String>,
    /// Module resources replaced to re-issue cluster trust material,
    /// addressed relative to the module
    #[serde(default = "default_certificate_resources")]
    pub certificate_resources: Vec<String>,
}

/// The module's cluster CA key and certificate. Certificates signed by the CA
/// depend on them and are re-issued with them.
fn default_certificate_resources() -> Vec<String> {
    vec![
        "tls_private_key.kube_ca".to_string(),
        "tls_self_signed_cert.kube_ca".to_string(),
    ]
}

/// Where the infrastructure state lives
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum BackendConfig {
    /// State file on local disk
    Local {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    /// State in an S3 bucket, optionally locked through DynamoDB
    S3 {
        bucket: String,
        key: String,
        region: String,
        #[serde(default, rename = "dynamodbTable")]
        dynamodb_table: Option<String>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Local { path: None }
    }
}

/// The `tool` block
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ToolConfig {
    /// Use this binary instead of searching for one
    #[serde(default)]
    pub binary: Option<PathBuf>,
    #[serde(default = "default_version_requirement")]
    pub version_requirement: String,
    /// Passed as `-parallelism` to apply and destroy
    #[serde(default)]
    pub parallelism: Option<u32>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            binary: None,
            version_requirement: default_version_requirement(),
            parallelism: None,
        }
    }
}

fn default_version_requirement() -> String {
    DEFAULT_VERSION_REQUIREMENT.to_string()
}

/// One entry of `components`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ComponentConfig {
    pub name: String,
    /// Chart directory or archive
    pub chart: PathBuf,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub values: serde_yaml::Value,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl ClusterConfig {
    /// Parse and validate a configuration document
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| Error::config(format!("failed to parse cluster config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Every problem in the document, reported together
    pub fn diagnostics(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let platform = &self.cluster.platform;

        if platform.module_path.as_os_str().is_empty() {
            problems.push("cluster.platform.modulePath must not be empty".to_string());
        }
        if platform.expected_nodes == 0 {
            problems.push("cluster.platform.expectedNodes must be at least 1".to_string());
        }
        if platform.certificate_resources.is_empty() {
            problems.push("cluster.platform.certificateResources must not be empty".to_string());
        }
        if let Some(address) = platform
            .certificate_resources
            .iter()
            .find(|a| a.trim().is_empty() || a.starts_with("module.") || a.contains(char::is_whitespace))
        {
            problems.push(format!(
                "cluster.platform.certificateResources: '{}' must be a resource address inside the module",
                address
            ));
        }
        if let Err(e) = semver::VersionReq::parse(&self.tool.version_requirement) {
            problems.push(format!(
                "tool.versionRequirement '{}' is invalid: {}",
                self.tool.version_requirement, e
            ));
        }
        if let BackendConfig::S3 { bucket, key, .. } = &self.cluster.backend {
            if bucket.is_empty() || key.is_empty() {
                problems.push("s3 backend needs both bucket and key".to_string());
            }
        }

        let mut seen = HashSet::new();
        for component in &self.components {
            if !seen.insert(component.name.as_str()) {
                problems.push(format!("component '{}' is listed twice", component.name));
            }
            if !component.values.is_null() && !component.values.is_mapping() {
                problems.push(format!("component '{}': values must be a mapping", component.name));
            }
        }

        problems
    }

    fn validate(&self) -> Result<()> {
        let problems = self.diagnostics();
        if problems.is_empty() {
            return Ok(());
        }
        Err(Error::config(format!(
            "invalid cluster config:\n  - {}",
            problems.join("\n  - ")
        )))
    }

    /// Resolve relative paths against `base`
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };

        resolve(&mut self.cluster.asset_dir);
        let platform = &mut self.cluster.platform;
        resolve(&mut platform.module_path);
        for path in [
            platform.charts_dir.as_mut(),
            platform.post_apply_manifests.as_mut(),
            self.tool.binary.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            resolve(path);
        }
        if let BackendConfig::Local { path: Some(path) } = &mut self.cluster.backend {
            resolve(path);
        }
        for component in &mut self.components {
            resolve(&mut component.chart);
        }
    }

    /// Merge a values overlay of the form `{ <component>: <values> }`
    pub fn apply_values_overlay(&mut self, overlay: serde_yaml::Value) -> Result<()> {
        let serde_yaml::Value::Mapping(entries) = overlay else {
            return Err(Error::config("values overlay must be a mapping of component names"));
        };

        for (name, values) in entries {
            let name = name
                .as_str()
                .ok_or_else(|| Error::config("values overlay keys must be component names"))?;
            let component = self
                .components
                .iter_mut()
                .find(|c| c.name == name)
                .ok_or_else(|| Error::config(format!("values overlay names unknown component '{}'", name)))?;
            deep_merge(&mut component.values, values);
        }
        Ok(())
    }

    /// The named components in configured order; all of them when `names` is empty
    pub fn select_components(&self, names: &[String]) -> Result<Vec<&ComponentConfig>> {
        if names.is_empty() {
            return Ok(self.components.iter().collect());
        }
        if let Some(unknown) = names
            .iter()
            .find(|n| !self.components.iter().any(|c| &c.name == *n))
        {
            return Err(Error::config(format!("component '{}' is not configured", unknown)));
        }
        Ok(self
            .components
            .iter()
            .filter(|c| names.contains(&c.name))
            .collect())
    }
}

/// Read, overlay and validate the configuration at `path`.
pub fn load(path: &Path, values_overlay: Option<&Path>) -> Result<ClusterConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
    let mut config = ClusterConfig::from_yaml(&content)?;

    if let Some(overlay_path) = values_overlay {
        let raw = std::fs::read_to_string(overlay_path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", overlay_path.display(), e))
        })?;
        let overlay: serde_yaml::Value = serde_yaml::from_str(&raw).map_err(|e| {
            Error::config(format!("failed to parse {}: {}", overlay_path.display(), e))
        })?;
        config.apply_values_overlay(overlay)?;
    }

    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    config.resolve_paths(&base);
    Ok(config)
}

/// Recursively merge `overlay` into `base`. Mappings merge key by key;
/// anything else in the overlay replaces the base value.
pub fn deep_merge(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base), serde_yaml::Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
cluster:
  platform:
    kind: terraform
    modulePath: ./modules/bare-metal
    expectedNodes: 3
"#;

    fn yaml(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = ClusterConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.cluster.asset_dir, PathBuf::from("assets"));
        assert_eq!(config.cluster.backend, BackendConfig::Local { path: None });
        assert_eq!(config.tool.version_requirement, DEFAULT_VERSION_REQUIREMENT);
        assert!(config.components.is_empty());
        assert_eq!(
            config.cluster.platform.certificate_resources,
            vec!["tls_private_key.kube_ca", "tls_self_signed_cert.kube_ca"]
        );
    }

    #[test]
    fn certificate_resources_are_module_relative() {
        let config = ClusterConfig::from_yaml(&format!(
            "{}    certificateResources: [tls_private_key.etcd_ca]\n",
            MINIMAL
        ))
        .unwrap();
        assert_eq!(config.cluster.platform.certificate_resources, vec!["tls_private_key.etcd_ca"]);

        for bad in ["[]", "[module.cluster.tls_private_key.kube_ca]"] {
            let err = ClusterConfig::from_yaml(&format!(
                "{}    certificateResources: {}\n",
                MINIMAL, bad
            ))
            .unwrap_err();
            assert!(err.to_string().contains("certificateResources"), "{}", bad);
        }
    }

    #[test]
    fn s3_backend_and_components_parse() {
        let config = ClusterConfig::from_yaml(
            r#"
cluster:
  assetDir: /var/lib/forge
  platform:
    kind: managed
    modulePath: ./modules/aks
    expectedNodes: 2
    variables:
      node_count: 2
  backend:
    type: s3
    bucket: forge-state
    key: forge.tfstate
    region: eu-central-1
    dynamodbTable: forge-locks
components:
  - name: cert-manager
    chart: ./charts/cert-manager
    namespace: cert-manager
    wait: true
    values:
      installCRDs: true
"#,
        )
        .unwrap();

        assert_eq!(config.cluster.platform.kind, PlatformKind::Managed);
        assert_eq!(config.cluster.platform.variables["node_count"], 2);
        match &config.cluster.backend {
            BackendConfig::S3 { dynamodb_table, .. } => {
                assert_eq!(dynamodb_table.as_deref(), Some("forge-locks"))
            }
            other => panic!("expected s3 backend, got {:?}", other),
        }
        assert_eq!(config.components[0].namespace, "cert-manager");
        assert!(config.components[0].wait);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = ClusterConfig::from_yaml(&format!("{}\nextra: true\n", MINIMAL)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn all_problems_are_reported_together() {
        let err = ClusterConfig::from_yaml(
            r#"
cluster:
  platform:
    kind: terraform
    modulePath: ""
    expectedNodes: 0
tool:
  versionRequirement: "not a range"
components:
  - { name: dns, chart: ./dns }
  - { name: dns, chart: ./dns }
"#,
        )
        .unwrap_err()
        .to_string();

        assert!(err.contains("modulePath"));
        assert!(err.contains("expectedNodes"));
        assert!(err.contains("versionRequirement"));
        assert!(err.contains("listed twice"));
    }

    #[test]
    fn relative_paths_follow_the_config_file() {
        let mut config = ClusterConfig::from_yaml(MINIMAL).unwrap();
        config.resolve_paths(Path::new("/srv/clusters/prod"));
        assert_eq!(
            config.cluster.asset_dir,
            PathBuf::from("/srv/clusters/prod/assets")
        );
        assert_eq!(
            config.cluster.platform.module_path,
            PathBuf::from("/srv/clusters/prod/./modules/bare-metal")
        );
    }

    // ==========================================================================
    // Story: values overlays
    // ==========================================================================

    #[test]
    fn nested_mappings_merge_key_by_key() {
        let mut base = yaml("controller:\n  replicas: 1\n  image: a\nrbac: true\n");
        deep_merge(&mut base, yaml("controller:\n  replicas: 3\nextra: [1]\n"));
        assert_eq!(
            base,
            yaml("controller:\n  replicas: 3\n  image: a\nrbac: true\nextra: [1]\n")
        );
    }

    #[test]
    fn scalars_and_sequences_are_replaced() {
        let mut base = yaml("args: [a, b]\n");
        deep_merge(&mut base, yaml("args: [c]\n"));
        assert_eq!(base, yaml("args: [c]\n"));
    }

    #[test]
    fn overlay_targets_components_by_name() {
        let mut config = ClusterConfig::from_yaml(&format!(
            "{}components:\n  - name: dns\n    chart: ./dns\n    values:\n      replicas: 1\n",
            MINIMAL
        ))
        .unwrap();
        config
            .apply_values_overlay(yaml("dns:\n  replicas: 2\n"))
            .unwrap();
        assert_eq!(config.components[0].values, yaml("replicas: 2\n"));

        assert!(config
            .apply_values_overlay(yaml("missing:\n  a: 1\n"))
            .is_err());
    }

    #[test]
    fn component_selection_keeps_configured_order() {
        let config = ClusterConfig::from_yaml(&format!(
            "{}components:\n  - {{ name: a, chart: ./a }}\n  - {{ name: b, chart: ./b }}\n  - {{ name: c, chart: ./c }}\n",
            MINIMAL
        ))
        .unwrap();

        let all: Vec<_> = config
            .select_components(&[])
            .unwrap()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(all, vec!["a", "b", "c"]);

        let picked: Vec<_> = config
            .select_components(&["c".to_string(), "a".to_string()])
            .unwrap()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(picked, vec!["a", "c"]);

        assert!(config.select_components(&["z".to_string()]).is_err());
    }
}
