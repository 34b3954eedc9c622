//! Node - a backend service instance eligible to receive routed requests
//!
//! Static attributes come from the node source. The mutable parts are split
//! by writer so that readers never wait on unrelated updates:
//! - `current_load`: atomic, moved only through [`Node::try_acquire`] / [`LoadGuard`]
//! - request counters: per-node mutex, written by the execution engine
//! - health: per-node rwlock, written by the health monitor

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::NodeSpec;

/// Reachability of a node as last observed by the health monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodeStatus {
    /// Not probed yet
    #[default]
    Unknown,
    /// Health endpoint answered with success
    Healthy,
    /// Health endpoint answered, but not with success
    Unhealthy,
    /// Transport failure or probe timeout
    Unreachable,
}

impl NodeStatus {
    pub fn is_healthy(self) -> bool {
        self == NodeStatus::Healthy
    }
}

/// Cumulative request counters for a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestCounters {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Incremental mean over every completed request
    pub average_response_time_ms: f64,
}

#[derive(Debug, Default)]
struct HealthState {
    status: NodeStatus,
    last_health_check: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Debug)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    pub capabilities: Vec<String>,
    pub tags: Vec<String>,
    /// Lower is more preferred
    pub priority: u32,
    pub max_concurrency: u32,
    pub timeout: Duration,
    pub api_key: Option<String>,
    current_load: AtomicU32,
    counters: Mutex<RequestCounters>,
    health: RwLock<HealthState>,
    /// Set once the node leaves the registry
    retired: AtomicBool,
}

impl Node {
    pub fn from_spec(spec: &NodeSpec) -> Self {
        Self {
            id: spec.id.clone(),
            name: spec.display_name().to_string(),
            endpoint: spec.endpoint.trim_end_matches('/').to_string(),
            capabilities: spec.capabilities.clone(),
            tags: spec.tags.clone(),
            priority: spec.priority,
            max_concurrency: spec.max_concurrency.max(1),
            timeout: Duration::from_millis(spec.timeout_ms),
            api_key: spec.api_key.clone(),
            current_load: AtomicU32::new(0),
            counters: Mutex::new(RequestCounters::default()),
            health: RwLock::new(HealthState::default()),
            retired: AtomicBool::new(false),
        }
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    // =========================================================================
    // Load
    // =========================================================================

    pub fn current_load(&self) -> u32 {
        self.current_load.load(Ordering::SeqCst)
    }

    /// Fraction of capacity in use, 0.0..=1.0
    pub fn load_ratio(&self) -> f64 {
        self.current_load() as f64 / self.max_concurrency as f64
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load() < self.max_concurrency
    }

    /// Reserve one concurrency slot. Returns `None` when the node is full.
    ///
    /// The slot is released when the returned guard is dropped, whatever the
    /// outcome of the call it covered.
    pub fn try_acquire(self: &Arc<Self>) -> Option<LoadGuard> {
        let max = self.max_concurrency;
        self.current_load
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |load| {
                (load < max).then_some(load + 1)
            })
            .ok()
            .map(|_| LoadGuard {
                node: Arc::clone(self),
            })
    }

    // =========================================================================
    // Counters
    // =========================================================================

    /// Count a finished request and fold its response time into the mean
    pub fn record_completion(&self, success: bool, response_time: Duration) {
        let mut counters = self.counters.lock();
        counters.total_requests += 1;
        if success {
            counters.successful_requests += 1;
        } else {
            counters.failed_requests += 1;
        }
        let sample = response_time.as_secs_f64() * 1000.0;
        let n = counters.total_requests as f64;
        counters.average_response_time_ms += (sample - counters.average_response_time_ms) / n;
    }

    pub fn counters(&self) -> RequestCounters {
        *self.counters.lock()
    }

    pub fn average_response_time_ms(&self) -> f64 {
        self.counters.lock().average_response_time_ms
    }

    // =========================================================================
    // Health
    // =========================================================================

    pub fn status(&self) -> NodeStatus {
        self.health.read().status
    }

    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        self.health.read().last_health_check
    }

    pub fn last_error(&self) -> Option<String> {
        self.health.read().last_error.clone()
    }

    /// Store a health check result and return the previous status
    pub fn set_health(&self, status: NodeStatus, error: Option<String>) -> NodeStatus {
        let mut health = self.health.write();
        let previous = health.status;
        health.status = status;
        health.last_health_check = Some(Utc::now());
        health.last_error = error;
        previous
    }
}

/// One reserved concurrency slot on a node
#[derive(Debug)]
pub struct LoadGuard {
    node: Arc<Node>,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.node.current_load.fetch_sub(1, Ordering::SeqCst);
    }
}
