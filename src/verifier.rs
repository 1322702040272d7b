//! Cluster readiness verification
//!
//! Two bounded loops run one after the other: the API server must answer,
//! then every expected node must report Ready. Each loop gets its own budget
//! (18 attempts, 10 seconds apart by default).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::format::{format_age, render_table};
use crate::retry::sleep_or_cancel;
use crate::{Error, Result};

/// Default number of attempts per readiness check
pub const DEFAULT_ATTEMPTS: u32 = 18;

/// Default pause between attempts
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Observed readiness of one node
#[derive(Clone, Debug, PartialEq)]
pub struct NodeReadiness {
    /// Node name
    pub name: String,
    /// Whether the node's Ready condition is True
    pub ready: bool,
    /// Comma-separated node roles
    pub roles: String,
    /// Kubelet version reported by the node
    pub version: String,
    /// Creation time, if known
    pub created: Option<DateTime<Utc>>,
}

/// Expected node count against the observed nodes
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeStatus {
    /// Number of nodes the platform declared
    pub expected: usize,
    /// Nodes currently registered with the API server
    pub nodes: Vec<NodeReadiness>,
}

impl NodeStatus {
    /// Every expected node is registered and all registered nodes are Ready
    pub fn ready(&self) -> bool {
        self.nodes.len() >= self.expected && self.nodes.iter().all(|n| n.ready)
    }

    /// Operator-facing table of the observed nodes
    pub fn table(&self) -> String {
        let rows: Vec<Vec<String>> = self
            .nodes
            .iter()
            .map(|n| {
                vec![
                    n.name.clone(),
                    if n.ready { "Ready" } else { "NotReady" }.to_string(),
                    n.roles.clone(),
                    n.created.as_ref().map(format_age).unwrap_or_default(),
                    n.version.clone(),
                ]
            })
            .collect();
        render_table(&["NAME", "STATUS", "ROLES", "AGE", "VERSION"], &rows)
    }
}

/// Health of one control-plane component
#[derive(Clone, Debug, PartialEq)]
pub struct ComponentHealth {
    /// Component name (e.g. "scheduler")
    pub name: String,
    /// Whether the component reports Healthy
    pub healthy: bool,
    /// Message or error reported alongside the condition
    pub message: String,
}

/// Read-only cluster queries used to judge readiness.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Succeeds once the API server answers
    async fn ping(&self) -> Result<()>;

    /// Current node readiness against the expected count
    async fn node_status(&self, expected: usize) -> Result<NodeStatus>;

    /// Control-plane component health as reported by the API server
    async fn component_statuses(&self) -> Result<Vec<ComponentHealth>>;
}

/// Budget for one readiness loop
#[derive(Clone, Debug)]
pub struct VerifierConfig {
    /// Attempts per loop
    pub attempts: u32,
    /// Pause between attempts
    pub interval: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            interval: DEFAULT_INTERVAL,
        }
    }
}

/// Waits for a freshly applied cluster to become usable.
pub struct ReadinessVerifier<'a> {
    cluster: &'a dyn ClusterApi,
    config: VerifierConfig,
    cancel: CancellationToken,
}

impl<'a> ReadinessVerifier<'a> {
    /// Create a verifier over the given cluster
    pub fn new(cluster: &'a dyn ClusterApi, config: VerifierConfig, cancel: CancellationToken) -> Self {
        Self {
            cluster,
            config,
            cancel,
        }
    }

    /// Connectivity first, then node readiness. Prints the node table on success.
    pub async fn verify(&self, expected_nodes: usize) -> Result<NodeStatus> {
        self.wait_for_api().await?;
        let status = self.wait_for_nodes(expected_nodes).await?;

        info!(nodes = status.nodes.len(), expected = expected_nodes, "cluster is ready");
        println!("\n{}\n", status.table());
        Ok(status)
    }

    /// Ping the API server until it answers or the budget runs out.
    pub async fn wait_for_api(&self) -> Result<()> {
        for attempt in 1..=self.config.attempts {
            match self.cluster.ping().await {
                Ok(()) => return Ok(()),
                Err(e) => debug!(attempt, error = %e, "cluster API not reachable yet"),
            }
            self.pause(attempt).await?;
        }

        Err(Error::ReadinessTimeout {
            what: "cluster API".to_string(),
            attempts: self.config.attempts,
        })
    }

    /// Query node status until every expected node is Ready.
    ///
    /// Query errors are retried like a not-ready answer, but the last one is
    /// kept and returned in preference to a plain timeout.
    pub async fn wait_for_nodes(&self, expected: usize) -> Result<NodeStatus> {
        let mut last_error = None;

        for attempt in 1..=self.config.attempts {
            match self.cluster.node_status(expected).await {
                Ok(status) if status.ready() => return Ok(status),
                Ok(status) => {
                    let ready = status.nodes.iter().filter(|n| n.ready).count();
                    info!(attempt, ready, expected, "waiting for nodes");
                }
                Err(e) => {
                    debug!(attempt, error = %e, "node status query failed");
                    last_error = Some(e);
                }
            }
            self.pause(attempt).await?;
        }

        Err(last_error.unwrap_or_else(|| Error::ReadinessTimeout {
            what: "nodes".to_string(),
            attempts: self.config.attempts,
        }))
    }

    async fn pause(&self, attempt: u32) -> Result<()> {
        if attempt < self.config.attempts {
            sleep_or_cancel(self.config.interval, &self.cancel).await
        } else if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
