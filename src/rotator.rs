//! Cluster certificate rotation
//!
//! After the control plane re-issues its trust material, every workload that
//! mounted the old CA has to pick up the new one. The rotator:
//!
//! 1. waits until every service-account token secret carries the new CA
//!    (bounded exponential backoff, default deadline 10 minutes);
//! 2. restarts each target by bumping its pod-template annotation;
//! 3. sleeps a settle delay so controller-manager election and reconciliation
//!    can catch up;
//! 4. waits for the workload's observed generation to reach the generation
//!    produced by the restart.
//!
//! Targets are processed one at a time. The first failure aborts the rest of
//! the queue; workloads already restarted stay restarted.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::retry::{sleep_or_cancel, wait_until, RetryConfig};
use crate::{Error, Result};

/// Default pause between a restart and its convergence check
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(10);

/// Workload kinds that can be restarted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    /// apps/v1 DaemonSet
    DaemonSet,
    /// apps/v1 Deployment
    Deployment,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DaemonSet => write!(f, "daemonset"),
            Self::Deployment => write!(f, "deployment"),
        }
    }
}

/// A workload to restart
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RotationTarget {
    pub namespace: String,
    pub name: String,
    pub kind: WorkloadKind,
}

impl RotationTarget {
    pub fn daemonset(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            kind: WorkloadKind::DaemonSet,
        }
    }

    pub fn deployment(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            kind: WorkloadKind::Deployment,
        }
    }
}

impl fmt::Display for RotationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Read-only view of a service-account token secret
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceAccountSecret {
    pub namespace: String,
    pub name: String,
    /// `ca.crt` bytes embedded in the token secret
    pub ca_cert: Vec<u8>,
}

/// Cluster operations the rotation needs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RotationClient: Send + Sync {
    /// Every service-account token secret across all namespaces
    async fn service_account_secrets(&self) -> Result<Vec<ServiceAccountSecret>>;

    /// Trigger a rolling restart; returns the generation the rollout produces
    async fn restart(&self, target: &RotationTarget) -> Result<i64>;

    /// Generation the workload's controller has observed so far
    async fn observed_generation(&self, target: &RotationTarget) -> Result<i64>;
}

/// DaemonSets first, then Deployments, all in kube-system.
pub fn default_targets() -> Vec<RotationTarget> {
    let ns = crate::upgrader::CONTROL_PLANE_NAMESPACE;
    vec![
        RotationTarget::daemonset(ns, "kube-apiserver"),
        RotationTarget::daemonset(ns, "pod-checkpointer"),
        RotationTarget::daemonset(ns, "kube-proxy"),
        RotationTarget::daemonset(ns, "calico-node"),
        RotationTarget::deployment(ns, "kube-controller-manager"),
        RotationTarget::deployment(ns, "kube-scheduler"),
        RotationTarget::deployment(ns, "coredns"),
        RotationTarget::deployment(ns, "calico-kube-controllers"),
    ]
}

/// Timing knobs for a rotation
#[derive(Clone, Debug)]
pub struct RotatorConfig {
    /// Pause after each restart before checking convergence
    pub settle_delay: Duration,
    /// Backoff and deadline for token propagation
    pub token_wait: RetryConfig,
    /// Backoff and deadline for each workload's convergence
    pub rollout_wait: RetryConfig,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            token_wait: RetryConfig::default(),
            rollout_wait: RetryConfig::default().with_timeout(Duration::from_secs(300)),
        }
    }
}

pub struct CertificateRotator<'a> {
    client: &'a dyn RotationClient,
    config: RotatorConfig,
    cancel: CancellationToken,
}

impl<'a> CertificateRotator<'a> {
    pub fn new(client: &'a dyn RotationClient, config: RotatorConfig, cancel: CancellationToken) -> Self {
        Self {
            client,
            config,
            cancel,
        }
    }

    /// Wait for the new CA, then restart every target in order.
    pub async fn rotate(&self, expected_ca: &[u8], targets: &[RotationTarget]) -> Result<()> {
        self.wait_for_token_propagation(expected_ca).await?;

        let total = targets.len();
        for (i, target) in targets.iter().enumerate() {
            info!(target = %target, "[{}/{}] restarting workload", i + 1, total);
            self.restart_and_converge(target).await.map_err(|e| {
                if e.is_cancelled() {
                    e
                } else {
                    Error::rotation(target.to_string(), e.to_string())
                }
            })?;
        }

        info!(workloads = total, "certificate rotation complete");
        Ok(())
    }

    /// Poll until every service-account token embeds `expected_ca`.
    pub async fn wait_for_token_propagation(&self, expected_ca: &[u8]) -> Result<()> {
        info!("waiting for service account tokens to carry the new CA");
        let client = self.client;

        wait_until(
            &self.config.token_wait,
            &self.cancel,
            "service account tokens",
            move || async move {
                let secrets = client.service_account_secrets().await?;
                let stale = secrets.iter().filter(|s| s.ca_cert != expected_ca).count();
                debug!(total = secrets.len(), stale, "checked service account tokens");
                Ok(stale == 0)
            },
        )
        .await
    }

    /// Restart one workload and wait for it to converge.
    pub async fn restart_and_converge(&self, target: &RotationTarget) -> Result<()> {
        let expected = self.client.restart(target).await?;
        sleep_or_cancel(self.config.settle_delay, &self.cancel).await?;

        let client = self.client;
        wait_until(
            &self.config.rollout_wait,
            &self.cancel,
            &target.to_string(),
            move || async move {
                let observed = client.observed_generation(target).await?;
                Ok(observed >= expected)
            },
        )
        .await
    }
}
