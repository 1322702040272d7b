//! Kubernetes API access for a provisioned cluster
//!
//! [`KubeCluster`] talks to the cluster behind the kubeconfig the platform
//! writes into its asset directory. The client is created on first use, since
//! the kubeconfig does not exist until the infrastructure has been applied.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ComponentStatus, Namespace, Node, Secret};
use kube::api::{Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::{Discovery, Scope};
use kube::{Client, Config};
#[cfg(test)]
use mockall::automock;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::rotator::{RotationClient, RotationTarget, ServiceAccountSecret, WorkloadKind};
use crate::verifier::{ClusterApi, ComponentHealth, NodeReadiness, NodeStatus};
use crate::{Error, Result, FIELD_MANAGER, NAMESPACE_NAME_LABEL};

/// Connect timeout for API clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout for API clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";
const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";
const NODE_ROLE_PREFIX: &str = "node-role.kubernetes.io/";

/// Create a client from a kubeconfig file with the default timeouts
pub async fn create_client(kubeconfig: &Path) -> Result<Client> {
    let raw = Kubeconfig::read_from(kubeconfig).map_err(|e| {
        Error::config(format!(
            "failed to read kubeconfig {}: {}",
            kubeconfig.display(),
            e
        ))
    })?;
    let mut config = Config::from_custom_kubeconfig(raw, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Ok(Client::try_from(config)?)
}

/// CA certificate bytes of the kubeconfig's current cluster.
///
/// After the control plane re-issues its trust material this is the value
/// every service-account token must converge on.
pub fn kubeconfig_ca(kubeconfig: &Path) -> Result<Vec<u8>> {
    let raw = Kubeconfig::read_from(kubeconfig)
        .map_err(|e| Error::config(format!("failed to read kubeconfig: {}", e)))?;

    let cluster_name = raw.current_context.as_ref().and_then(|current| {
        raw.contexts
            .iter()
            .find(|c| &c.name == current)
            .and_then(|c| c.context.as_ref())
            .map(|c| c.cluster.clone())
    });

    let cluster = raw
        .clusters
        .iter()
        .find(|c| Some(&c.name) == cluster_name.as_ref())
        .or_else(|| raw.clusters.first())
        .and_then(|c| c.cluster.as_ref())
        .ok_or_else(|| Error::config("kubeconfig has no clusters"))?;

    let data = cluster
        .certificate_authority_data
        .as_ref()
        .ok_or_else(|| Error::config("kubeconfig cluster has no certificate-authority-data"))?;

    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| Error::config(format!("invalid certificate-authority-data: {}", e)))
}

/// Labels every namespace with its own name.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NamespaceLabeler: Send + Sync {
    /// Returns how many namespaces needed the label
    async fn label_namespaces(&self) -> Result<usize>;
}

/// Cluster reachable through a kubeconfig on disk
pub struct KubeCluster {
    kubeconfig: PathBuf,
    client: OnceCell<Client>,
}

impl KubeCluster {
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
            client: OnceCell::new(),
        }
    }

    pub fn kubeconfig(&self) -> &Path {
        &self.kubeconfig
    }

    async fn client(&self) -> Result<Client> {
        self.client
            .get_or_try_init(|| create_client(&self.kubeconfig))
            .await
            .cloned()
    }

    /// Delete a namespace; a namespace that is already gone is not an error
    pub async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client().await?);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(namespace = name, "namespace deleted");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Server-side apply a set of YAML documents, resolving kinds through discovery.
    ///
    /// Documents are applied in dependency order (namespaces and CRDs first,
    /// workloads last).
    pub async fn apply_manifests(&self, documents: &[String]) -> Result<usize> {
        let client = self.client().await?;
        let discovery = Discovery::new(client.clone()).run().await?;
        let params = PatchParams::apply(FIELD_MANAGER).force();

        let mut objects = Vec::with_capacity(documents.len());
        for doc in documents {
            let object: DynamicObject = serde_yaml::from_str(doc)
                .map_err(|e| Error::serialization(format!("invalid manifest: {}", e)))?;
            objects.push(object);
        }
        objects.sort_by_key(|o| {
            kind_priority(o.types.as_ref().map(|t| t.kind.as_str()).unwrap_or_default())
        });

        for object in &objects {
            let types = object
                .types
                .as_ref()
                .ok_or_else(|| Error::validation("manifest is missing apiVersion/kind"))?;
            let name = object
                .metadata
                .name
                .as_deref()
                .ok_or_else(|| Error::validation(format!("{} is missing metadata.name", types.kind)))?;

            let gvk = GroupVersionKind::try_from(types)
                .map_err(|e| Error::validation(format!("{}: {}", types.kind, e)))?;
            let (resource, caps) = discovery.resolve_gvk(&gvk).ok_or_else(|| {
                Error::validation(format!("{} is not served by the cluster", types.api_version))
            })?;

            let api: Api<DynamicObject> = match (caps.scope, object.metadata.namespace.as_deref()) {
                (Scope::Namespaced, Some(ns)) => Api::namespaced_with(client.clone(), ns, &resource),
                (Scope::Namespaced, None) => Api::default_namespaced_with(client.clone(), &resource),
                (Scope::Cluster, _) => Api::all_with(client.clone(), &resource),
            };
            api.patch(name, &params, &Patch::Apply(object)).await?;
            debug!(kind = %types.kind, name, "applied manifest");
        }

        Ok(objects.len())
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn ping(&self) -> Result<()> {
        let client = self.client().await?;
        let info = client.apiserver_version().await?;
        debug!(version = %info.git_version, "cluster API answered");
        Ok(())
    }

    async fn node_status(&self, expected: usize) -> Result<NodeStatus> {
        let nodes: Api<Node> = Api::all(self.client().await?);
        let list = nodes.list(&ListParams::default()).await?;
        Ok(NodeStatus {
            expected,
            nodes: list.items.iter().map(node_readiness).collect(),
        })
    }

    async fn component_statuses(&self) -> Result<Vec<ComponentHealth>> {
        let api: Api<ComponentStatus> = Api::all(self.client().await?);
        let list = api.list(&ListParams::default()).await?;

        Ok(list
            .items
            .iter()
            .map(|cs| {
                let healthy = cs
                    .conditions
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .find(|c| c.type_ == "Healthy");
                ComponentHealth {
                    name: cs.metadata.name.clone().unwrap_or_default(),
                    healthy: healthy.map(|c| c.status == "True").unwrap_or(false),
                    message: healthy
                        .and_then(|c| c.error.clone().or_else(|| c.message.clone()))
                        .unwrap_or_default(),
                }
            })
            .collect())
    }
}

#[async_trait]
impl NamespaceLabeler for KubeCluster {
    async fn label_namespaces(&self) -> Result<usize> {
        let api: Api<Namespace> = Api::all(self.client().await?);
        let params = PatchParams::apply(FIELD_MANAGER);
        let mut labeled = 0;

        for ns in api.list(&ListParams::default()).await?.items {
            let Some(name) = ns.metadata.name.as_deref() else {
                continue;
            };
            let current = ns
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(NAMESPACE_NAME_LABEL));
            if current.map(String::as_str) == Some(name) {
                continue;
            }

            let labels = BTreeMap::from([(NAMESPACE_NAME_LABEL.to_string(), name.to_string())]);
            let patch = serde_json::json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": { "name": name, "labels": labels }
            });
            api.patch(name, &params, &Patch::Apply(&patch)).await?;
            labeled += 1;
        }

        info!(labeled, "namespaces labeled");
        Ok(labeled)
    }
}

#[async_trait]
impl RotationClient for KubeCluster {
    async fn service_account_secrets(&self) -> Result<Vec<ServiceAccountSecret>> {
        let api: Api<Secret> = Api::all(self.client().await?);
        let params = ListParams::default().fields(&format!("type={}", SERVICE_ACCOUNT_TOKEN_TYPE));

        Ok(api
            .list(&params)
            .await?
            .items
            .into_iter()
            .map(|secret| ServiceAccountSecret {
                namespace: secret.metadata.namespace.unwrap_or_default(),
                name: secret.metadata.name.unwrap_or_default(),
                ca_cert: secret
                    .data
                    .and_then(|mut d| d.remove("ca.crt"))
                    .map(|b| b.0)
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn restart(&self, target: &RotationTarget) -> Result<i64> {
        let client = self.client().await?;
        let patch = restart_patch(&chrono::Utc::now().to_rfc3339());
        let params = PatchParams::default();

        let generation = match target.kind {
            WorkloadKind::DaemonSet => {
                let api: Api<DaemonSet> = Api::namespaced(client, &target.namespace);
                api.patch(&target.name, &params, &Patch::Merge(&patch))
                    .await?
                    .metadata
                    .generation
            }
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(client, &target.namespace);
                api.patch(&target.name, &params, &Patch::Merge(&patch))
                    .await?
                    .metadata
                    .generation
            }
        };

        generation.ok_or_else(|| Error::rotation(target.to_string(), "restart returned no generation"))
    }

    async fn observed_generation(&self, target: &RotationTarget) -> Result<i64> {
        let client = self.client().await?;
        let observed = match target.kind {
            WorkloadKind::DaemonSet => {
                let api: Api<DaemonSet> = Api::namespaced(client, &target.namespace);
                api.get(&target.name)
                    .await?
                    .status
                    .and_then(|s| s.observed_generation)
            }
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(client, &target.namespace);
                api.get(&target.name)
                    .await?
                    .status
                    .and_then(|s| s.observed_generation)
            }
        };
        Ok(observed.unwrap_or_default())
    }
}

fn restart_patch(timestamp: &str) -> serde_json::Value {
    serde_json::json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": { RESTARTED_AT_ANNOTATION: timestamp }
                }
            }
        }
    })
}

fn node_readiness(node: &Node) -> NodeReadiness {
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false);

    let mut roles: Vec<&str> = node
        .metadata
        .labels
        .iter()
        .flatten()
        .filter_map(|(k, _)| k.strip_prefix(NODE_ROLE_PREFIX))
        .filter(|r| !r.is_empty())
        .collect();
    roles.sort_unstable();

    NodeReadiness {
        name: node.metadata.name.clone().unwrap_or_default(),
        ready,
        roles: if roles.is_empty() {
            "<none>".to_string()
        } else {
            roles.join(",")
        },
        version: node
            .status
            .as_ref()
            .and_then(|s| s.node_info.as_ref())
            .map(|i| i.kubelet_version.clone())
            .unwrap_or_default(),
        created: node.metadata.creation_timestamp.as_ref().map(|t| t.0),
    }
}

/// Apply order for manifest kinds; lower goes first
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" => 5,
        "Service" => 6,
        "Deployment" | "DaemonSet" | "StatefulSet" => 7,
        _ => 8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus as K8sNodeStatus, NodeSystemInfo};
    use kube::api::ObjectMeta;
    use std::io::Write;

    fn node(name: &str, ready: &str, roles: &[&str]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    roles
                        .iter()
                        .map(|r| (format!("{}{}", NODE_ROLE_PREFIX, r), String::new()))
                        .collect(),
                ),
                ..Default::default()
            },
            status: Some(K8sNodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: ready.to_string(),
                    ..Default::default()
                }]),
                node_info: Some(NodeSystemInfo {
                    kubelet_version: "v1.31.2".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn ready_condition_decides_node_readiness() {
        let ready = node_readiness(&node("controller-0", "True", &["control-plane", "master"]));
        assert!(ready.ready);
        assert_eq!(ready.roles, "control-plane,master");
        assert_eq!(ready.version, "v1.31.2");

        let not_ready = node_readiness(&node("worker-0", "Unknown", &[]));
        assert!(!not_ready.ready);
        assert_eq!(not_ready.roles, "<none>");
    }

    #[test]
    fn node_without_status_is_not_ready() {
        let bare = Node {
            metadata: ObjectMeta {
                name: Some("worker-1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!node_readiness(&bare).ready);
    }

    #[test]
    fn restart_bumps_the_pod_template_annotation() {
        let patch = restart_patch("2026-10-19T12:00:00+00:00");
        assert_eq!(
            patch["spec"]["template"]["metadata"]["annotations"][RESTARTED_AT_ANNOTATION],
            "2026-10-19T12:00:00+00:00"
        );
    }

    #[test]
    fn namespaces_and_crds_apply_before_workloads() {
        let mut kinds = vec!["Deployment", "Namespace", "ConfigMap", "CustomResourceDefinition"];
        kinds.sort_by_key(|k| kind_priority(k));
        assert_eq!(
            kinds,
            vec!["Namespace", "CustomResourceDefinition", "ConfigMap", "Deployment"]
        );
    }

    fn write_kubeconfig(ca_data: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"apiVersion: v1
kind: Config
current-context: admin@forge
clusters:
- name: other
  cluster:
    server: https://10.0.0.9:6443
    certificate-authority-data: b3RoZXI=
- name: forge
  cluster:
    server: https://10.0.0.1:6443
    certificate-authority-data: {}
contexts:
- name: admin@forge
  context:
    cluster: forge
    user: admin
users:
- name: admin
  user:
    token: abc
"#,
            ca_data
        )
        .unwrap();
        file
    }

    #[test]
    fn expected_ca_comes_from_the_current_context() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("new-ca");
        let file = write_kubeconfig(&encoded);
        assert_eq!(kubeconfig_ca(file.path()).unwrap(), b"new-ca".to_vec());
    }

    #[test]
    fn undecodable_ca_is_a_config_error() {
        let file = write_kubeconfig("!!!not-base64!!!");
        assert!(matches!(kubeconfig_ca(file.path()), Err(Error::Config(_))));
    }
}
