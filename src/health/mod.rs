//! Health Monitor - active reachability probing for registered nodes
//!
//! A sweep runs every `interval` and a node is also checked as soon as it is
//! registered. Each probe runs in its own task under its own timeout, so a
//! slow or hung node only ever delays its own result.
//!
//! Classification:
//! - 2xx from the health endpoint → `Healthy`
//! - any other HTTP status → `Unhealthy`
//! - connection/transport failure or probe timeout → `Unreachable`

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::config::HealthSettings;
use crate::registry::{Node, NodeRegistry, NodeStatus};

/// Configuration for the health monitor
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// Per-probe deadline
    pub probe_timeout: Duration,
    /// Health endpoint path appended to the node endpoint
    pub path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            path: "/health".to_string(),
        }
    }
}

impl From<&HealthSettings> for HealthConfig {
    fn from(settings: &HealthSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_secs),
            probe_timeout: Duration::from_secs(settings.timeout_secs),
            path: settings.path.clone(),
        }
    }
}

/// Result of a single health probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum ProbeOutcome {
    Healthy { latency_ms: u64 },
    Unhealthy { status_code: u16 },
    Unreachable { reason: String },
}

impl ProbeOutcome {
    pub fn status(&self) -> NodeStatus {
        match self {
            ProbeOutcome::Healthy { .. } => NodeStatus::Healthy,
            ProbeOutcome::Unhealthy { .. } => NodeStatus::Unhealthy,
            ProbeOutcome::Unreachable { .. } => NodeStatus::Unreachable,
        }
    }

    pub fn error(&self) -> Option<String> {
        match self {
            ProbeOutcome::Healthy { .. } => None,
            ProbeOutcome::Unhealthy { status_code } => Some(format!("HTTP {}", status_code)),
            ProbeOutcome::Unreachable { reason } => Some(reason.clone()),
        }
    }
}

/// Performs one reachability probe against a node
#[async_trait]
pub trait HealthProber: Send + Sync {
    async fn probe(&self, node: &Node) -> ProbeOutcome;
}

/// Probes `GET {endpoint}{path}` over HTTP
#[derive(Clone)]
pub struct HttpProber {
    client: Client,
    path: String,
}

impl HttpProber {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl HealthProber for HttpProber {
    async fn probe(&self, node: &Node) -> ProbeOutcome {
        let url = format!("{}{}", node.endpoint, self.path);
        let start = Instant::now();

        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => ProbeOutcome::Healthy {
                latency_ms: start.elapsed().as_millis() as u64,
            },
            Ok(response) => ProbeOutcome::Unhealthy {
                status_code: response.status().as_u16(),
            },
            Err(e) => ProbeOutcome::Unreachable {
                reason: e.to_string(),
            },
        }
    }
}

/// Tally of one sweep across all nodes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthSweepReport {
    pub healthy: usize,
    pub unhealthy: usize,
    pub unreachable: usize,
    /// Probe tasks that panicked or were cancelled
    pub failed: usize,
}

impl HealthSweepReport {
    fn tally(&mut self, status: NodeStatus) {
        match status {
            NodeStatus::Healthy => self.healthy += 1,
            NodeStatus::Unhealthy => self.unhealthy += 1,
            NodeStatus::Unreachable => self.unreachable += 1,
            NodeStatus::Unknown => {}
        }
    }

    pub fn total(&self) -> usize {
        self.healthy + self.unhealthy + self.unreachable + self.failed
    }
}

#[derive(Clone)]
pub struct HealthMonitor {
    registry: NodeRegistry,
    prober: Arc<dyn HealthProber>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(registry: NodeRegistry, prober: Arc<dyn HealthProber>, config: HealthConfig) -> Self {
        Self {
            registry,
            prober,
            config,
        }
    }

    /// Monitor that probes over HTTP at `config.path`
    pub fn with_http(registry: NodeRegistry, config: HealthConfig) -> Self {
        let prober = Arc::new(HttpProber::new(config.path.clone()));
        Self::new(registry, prober, config)
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Probe one node and store the result on it
    pub async fn check_node(&self, node: &Arc<Node>) -> NodeStatus {
        check_one(Arc::clone(&self.prober), Arc::clone(node), self.config.probe_timeout).await
    }

    /// Probe every registered node concurrently, one task per node
    pub async fn check_all(&self) -> HealthSweepReport {
        self.check_nodes(self.registry.all()).await
    }

    /// Probe the given nodes concurrently, one task per node
    pub async fn check_nodes(&self, nodes: Vec<Arc<Node>>) -> HealthSweepReport {
        let mut report = HealthSweepReport::default();

        if nodes.is_empty() {
            trace!("No nodes to probe");
            return report;
        }

        debug!("Probing {} nodes", nodes.len());

        let mut tasks = JoinSet::new();
        for node in nodes {
            tasks.spawn(check_one(
                Arc::clone(&self.prober),
                node,
                self.config.probe_timeout,
            ));
        }

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(status) => report.tally(status),
                Err(e) => {
                    warn!("Health probe task failed: {}", e);
                    report.failed += 1;
                }
            }
        }

        debug!(
            "Health sweep: {} healthy, {} unhealthy, {} unreachable, {} failed",
            report.healthy, report.unhealthy, report.unreachable, report.failed
        );
        report
    }
}

async fn check_one(prober: Arc<dyn HealthProber>, node: Arc<Node>, probe_timeout: Duration) -> NodeStatus {
    let outcome = match timeout(probe_timeout, prober.probe(&node)).await {
        Ok(outcome) => outcome,
        Err(_) => ProbeOutcome::Unreachable {
            reason: format!("Probe timed out after {}ms", probe_timeout.as_millis()),
        },
    };

    let status = outcome.status();
    let previous = node.set_health(status, outcome.error());

    match (previous, status) {
        (NodeStatus::Healthy, NodeStatus::Healthy) => {}
        (NodeStatus::Healthy, _) => {
            warn!("Node {} is now {:?}: {:?}", node.id, status, outcome.error())
        }
        (NodeStatus::Unhealthy | NodeStatus::Unreachable, NodeStatus::Healthy) => {
            info!("Node {} recovered", node.id)
        }
        _ => debug!("Node {} health: {:?}", node.id, status),
    }

    status
}

/// Run a sweep every `interval` until the shutdown signal flips to true
pub fn spawn_health_monitor(monitor: HealthMonitor, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = monitor.config().interval;
        info!("Starting health monitor: interval={}s", interval.as_secs());

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    monitor.check_all().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Health monitor shutting down");
                        break;
                    }
                }
            }
        }
    })
}
