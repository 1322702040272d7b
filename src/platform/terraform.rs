//! Module-backed platform
//!
//! The asset directory gets three generated files:
//!
//! - `main.tf.json` declares one variable per configured input, instantiates
//!   the platform module with them and re-exports the module outputs the
//!   control-plane upgrade needs (`<release>_values`, kubelet included);
//! - `terraform.tfvars.json` carries the variable values;
//! - `backend.tf.json` selects where state is stored.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::info;

use super::{ManifestDirHook, ManualStepHook, Platform, PlatformMeta, PostApplyHook};
use crate::config::{BackendConfig, ClusterConfig, PlatformKind};
use crate::executor::{to_args, ExecutionStep, InfraTool};
use crate::prompt::Prompter;
use crate::release::ComponentRelease;
use crate::upgrader::{default_releases, values_key, KUBELET_RELEASE};
use crate::{Error, Result};

pub const MAIN_FILE: &str = "main.tf.json";
pub const TFVARS_FILE: &str = "terraform.tfvars.json";
pub const BACKEND_FILE: &str = "backend.tf.json";

/// Name of the module block in the generated root module
const MODULE_NAME: &str = "cluster";

/// Platform that provisions a cluster through an infrastructure module.
pub struct TerraformPlatform {
    kind: PlatformKind,
    asset_dir: PathBuf,
    module_path: PathBuf,
    expected_nodes: usize,
    variables: Map<String, Value>,
    backend: BackendConfig,
    control_plane_charts: Vec<ComponentRelease>,
    charts_dir: PathBuf,
    parallelism: Option<u32>,
    certificate_resources: Vec<String>,
    manual_step: Option<Arc<ManualStepHook>>,
    post_apply: Option<Arc<ManifestDirHook>>,
}

impl TerraformPlatform {
    pub fn from_config(config: &ClusterConfig, prompter: Arc<dyn Prompter>) -> Result<Self> {
        let platform = &config.cluster.platform;
        let asset_dir = config.cluster.asset_dir.clone();

        let module_path = if platform.module_path.is_relative() {
            std::env::current_dir()?.join(&platform.module_path)
        } else {
            platform.module_path.clone()
        };

        Ok(Self {
            kind: platform.kind,
            module_path,
            expected_nodes: platform.expected_nodes,
            variables: platform
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            backend: config.cluster.backend.clone(),
            control_plane_charts: platform
                .control_plane_charts
                .clone()
                .unwrap_or_else(|| default_releases(false)),
            charts_dir: platform
                .charts_dir
                .clone()
                .unwrap_or_else(|| asset_dir.join("charts")),
            parallelism: config.tool.parallelism,
            certificate_resources: platform.certificate_resources.clone(),
            manual_step: platform
                .manual_step_message
                .as_ref()
                .map(|m| Arc::new(ManualStepHook::new(m.clone(), prompter))),
            post_apply: platform
                .post_apply_manifests
                .as_ref()
                .map(|dir| Arc::new(ManifestDirHook::new(dir.clone()))),
            asset_dir,
        })
    }

    /// Generated root module
    pub fn render_main(&self) -> Value {
        let mut variables = Map::new();
        let mut module = Map::new();
        module.insert(
            "source".to_string(),
            Value::String(self.module_path.display().to_string()),
        );
        module.insert(
            "asset_dir".to_string(),
            Value::String(self.asset_dir.display().to_string()),
        );
        for name in self.variables.keys() {
            variables.insert(name.clone(), json!({}));
            module.insert(name.clone(), Value::String(format!("${{var.{}}}", name)));
        }

        let mut main = Map::new();
        if !variables.is_empty() {
            main.insert("variable".to_string(), Value::Object(variables));
        }
        main.insert("module".to_string(), json!({ MODULE_NAME: module }));

        // A managed control plane has no release values to re-export.
        if self.kind == PlatformKind::Terraform {
            let mut releases: Vec<&str> =
                self.control_plane_charts.iter().map(|r| r.name.as_str()).collect();
            if !releases.contains(&KUBELET_RELEASE) {
                releases.push(KUBELET_RELEASE);
            }
            let outputs: Map<String, Value> = releases
                .into_iter()
                .map(|release| {
                    let key = values_key(release);
                    let value = json!({
                        "value": format!("${{module.{}.{}}}", MODULE_NAME, key),
                        "sensitive": true,
                    });
                    (key, value)
                })
                .collect();
            main.insert("output".to_string(), Value::Object(outputs));
        }

        Value::Object(main)
    }

    /// Variable values file
    pub fn render_tfvars(&self) -> Value {
        Value::Object(self.variables.clone())
    }

    /// Apply arguments forcing replacement of every certificate resource
    pub fn rotation_args(&self) -> Vec<String> {
        let mut args = self.mutation_args("apply");
        args.extend(
            self.certificate_resources
                .iter()
                .map(|address| format!("-replace=module.{}.{}", MODULE_NAME, address)),
        );
        args
    }

    fn mutation_args(&self, command: &str) -> Vec<String> {
        let mut args = to_args([command, "-auto-approve", "-input=false"]);
        if let Some(n) = self.parallelism {
            args.push(format!("-parallelism={}", n));
        }
        args
    }
}

/// Backend selection file for the configured state backend
pub fn render_backend(backend: &BackendConfig) -> Value {
    match backend {
        BackendConfig::Local { path } => {
            let mut local = Map::new();
            if let Some(path) = path {
                local.insert(
                    "path".to_string(),
                    Value::String(path.display().to_string()),
                );
            }
            json!({ "terraform": { "backend": { "local": local } } })
        }
        BackendConfig::S3 {
            bucket,
            key,
            region,
            dynamodb_table,
        } => {
            let mut s3 = json!({
                "bucket": bucket,
                "key": key,
                "region": region,
                "encrypt": true,
            });
            if let Some(table) = dynamodb_table {
                s3["dynamodb_table"] = Value::String(table.clone());
            }
            json!({ "terraform": { "backend": { "s3": s3 } } })
        }
    }
}

async fn write_json(path: PathBuf, value: &Value) -> Result<()> {
    let body = serde_json::to_vec_pretty(value)
        .map_err(|e| Error::serialization(format!("{}: {}", path.display(), e)))?;
    tokio::fs::write(&path, body).await?;
    Ok(())
}

#[async_trait]
impl Platform for TerraformPlatform {
    fn meta(&self) -> PlatformMeta {
        PlatformMeta {
            asset_dir: self.asset_dir.clone(),
            expected_nodes: self.expected_nodes,
            managed: self.kind == PlatformKind::Managed,
            control_plane_charts: self.control_plane_charts.clone(),
            charts_dir: self.charts_dir.clone(),
        }
    }

    async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.asset_dir).await?;

        write_json(self.asset_dir.join(MAIN_FILE), &self.render_main()).await?;
        write_json(self.asset_dir.join(TFVARS_FILE), &self.render_tfvars()).await?;
        write_json(self.asset_dir.join(BACKEND_FILE), &render_backend(&self.backend)).await?;

        info!(asset_dir = %self.asset_dir.display(), "infrastructure definition written");
        Ok(())
    }

    async fn apply(&self, tool: &dyn InfraTool) -> Result<()> {
        let mut step = ExecutionStep::new("create infrastructure", self.mutation_args("apply"));
        if let Some(hook) = &self.manual_step {
            step = step.with_hook(hook.clone());
        }
        tool.execute_steps(vec![step]).await
    }

    async fn destroy(&self, tool: &dyn InfraTool) -> Result<()> {
        tool.execute(&self.mutation_args("destroy")).await
    }

    async fn rotate_certificates(&self, tool: &dyn InfraTool) -> Result<()> {
        if self.certificate_resources.is_empty() {
            return Err(Error::config("no certificate resources configured to replace"));
        }
        info!(resources = ?self.certificate_resources, "replacing certificate resources");
        tool.execute(&self.rotation_args()).await
    }

    fn post_apply_hook(&self) -> Option<Arc<dyn PostApplyHook>> {
        self.post_apply
            .clone()
            .map(|hook| hook as Arc<dyn PostApplyHook>)
    }
}
