//! Rolling performance metrics per node
//!
//! Every dispatched call is recorded as an [`OutcomeEvent`] in the node's
//! bounded window. After each record the derived scores are recomputed:
//!
//! - `success_rate`: successes / total over the window (lifetime totals while
//!   the window holds fewer than [`MIN_WINDOW_SAMPLES`] events), as 0-100
//! - `reliability`: `max(0, 100 - 10 * failures in the last hour)`
//! - `efficiency`: `max(0, 100 - mean latency (ms) in the last hour / 100)`
//!
//! Each node's history sits behind its own mutex, so concurrent records
//! against different nodes never contend.

pub mod persistence;
pub mod window;

pub use persistence::{load_snapshot, save_snapshot, spawn_snapshotter, MetricsSnapshot, PersistenceError};
pub use window::RollingWindow;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Below this many windowed events, success rate uses lifetime totals
pub const MIN_WINDOW_SAMPLES: usize = 5;

/// Default number of outcome events kept per node
pub const DEFAULT_WINDOW_SIZE: usize = 100;

/// Span that reliability and efficiency look back over
fn recent_window() -> chrono::Duration {
    chrono::Duration::hours(1)
}

/// A single completed call against a node
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeEvent {
    pub at: DateTime<Utc>,
    pub latency_ms: u64,
    pub success: bool,
}

impl OutcomeEvent {
    pub fn now(success: bool, latency: Duration) -> Self {
        Self {
            at: Utc::now(),
            latency_ms: latency.as_millis() as u64,
            success,
        }
    }
}

/// Derived scores for one node, all on a 0-100 scale
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub success_rate: f64,
    pub reliability: f64,
    pub efficiency: f64,
    /// Events currently held in the window
    pub samples: usize,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Mean latency over the last hour (0 when nothing recent)
    pub recent_latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for PerformanceMetrics {
    /// A node without history is given the benefit of the doubt
    fn default() -> Self {
        Self {
            success_rate: 100.0,
            reliability: 100.0,
            efficiency: 100.0,
            samples: 0,
            total_successes: 0,
            total_failures: 0,
            recent_latency_ms: 0.0,
            updated_at: None,
        }
    }
}

impl PerformanceMetrics {
    /// Success rate as a fraction in 0.0..=1.0
    pub fn success_ratio(&self) -> f64 {
        self.success_rate / 100.0
    }
}

#[derive(Debug)]
struct NodePerformance {
    window: RollingWindow<OutcomeEvent>,
    total_successes: u64,
    total_failures: u64,
    metrics: PerformanceMetrics,
}

impl NodePerformance {
    fn new(window_size: usize) -> Self {
        Self {
            window: RollingWindow::new(window_size),
            total_successes: 0,
            total_failures: 0,
            metrics: PerformanceMetrics::default(),
        }
    }

    fn record(&mut self, event: OutcomeEvent) {
        if event.success {
            self.total_successes += 1;
        } else {
            self.total_failures += 1;
        }
        self.window.push(event);
    }

    fn recompute(&mut self, now: DateTime<Utc>) {
        let (window_successes, window_total) = self
            .window
            .iter()
            .fold((0u64, 0u64), |(s, t), e| (s + e.success as u64, t + 1));

        let (successes, total) = if self.window.len() >= MIN_WINDOW_SAMPLES {
            (window_successes, window_total)
        } else {
            (self.total_successes, self.total_successes + self.total_failures)
        };

        let success_rate = if total > 0 {
            successes as f64 / total as f64 * 100.0
        } else {
            100.0
        };

        let cutoff = now - recent_window();
        let recent: Vec<&OutcomeEvent> = self.window.iter().filter(|e| e.at >= cutoff).collect();
        let recent_failures = recent.iter().filter(|e| !e.success).count();
        let recent_latency_ms = if recent.is_empty() {
            0.0
        } else {
            recent.iter().map(|e| e.latency_ms as f64).sum::<f64>() / recent.len() as f64
        };

        self.metrics = PerformanceMetrics {
            success_rate,
            reliability: (100.0 - 10.0 * recent_failures as f64).max(0.0),
            efficiency: (100.0 - recent_latency_ms / 100.0).max(0.0),
            samples: self.window.len(),
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            recent_latency_ms,
            updated_at: Some(now),
        };
    }
}

/// Owner of all per-node performance histories, keyed by node id
pub struct PerformanceTracker {
    nodes: DashMap<String, Arc<Mutex<NodePerformance>>>,
    window_size: usize,
}

impl PerformanceTracker {
    pub fn new(window_size: usize) -> Self {
        Self {
            nodes: DashMap::new(),
            window_size: window_size.max(1),
        }
    }

    fn entry(&self, node_id: &str) -> Arc<Mutex<NodePerformance>> {
        if let Some(existing) = self.nodes.get(node_id) {
            return Arc::clone(existing.value());
        }
        let window_size = self.window_size;
        Arc::clone(
            self.nodes
                .entry(node_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(NodePerformance::new(window_size))))
                .value(),
        )
    }

    /// Record the outcome of one call and return the recomputed metrics
    pub fn record_outcome(&self, node_id: &str, success: bool, latency: Duration) -> PerformanceMetrics {
        self.record_event(node_id, OutcomeEvent::now(success, latency))
    }

    /// Record the outcome only while `live()` holds.
    ///
    /// `live` is evaluated under the map's shard lock, so once it turns false
    /// a following [`forget`](Self::forget) cannot be undone by a late record.
    pub fn record_outcome_if(
        &self,
        node_id: &str,
        success: bool,
        latency: Duration,
        live: impl FnOnce() -> bool,
    ) -> Option<PerformanceMetrics> {
        let window_size = self.window_size;
        let entry = {
            let slot = self.nodes.entry(node_id.to_string());
            if !live() {
                return None;
            }
            Arc::clone(
                slot.or_insert_with(|| Arc::new(Mutex::new(NodePerformance::new(window_size))))
                    .value(),
            )
        };

        let mut perf = entry.lock();
        perf.record(OutcomeEvent::now(success, latency));
        perf.recompute(Utc::now());
        Some(perf.metrics)
    }

    /// Record an event with an explicit timestamp
    pub fn record_event(&self, node_id: &str, event: OutcomeEvent) -> PerformanceMetrics {
        let entry = self.entry(node_id);
        let mut perf = entry.lock();
        perf.record(event);
        perf.recompute(Utc::now());
        perf.metrics
    }

    /// Current metrics for a node; defaults when nothing has been recorded
    pub fn metrics(&self, node_id: &str) -> PerformanceMetrics {
        self.nodes
            .get(node_id)
            .map(|entry| entry.value().lock().metrics)
            .unwrap_or_default()
    }

    pub fn tracked_nodes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn forget(&self, node_id: &str) {
        self.nodes.remove(node_id);
    }

    /// Copy every node's windowed events, oldest first
    pub fn export_history(&self) -> HashMap<String, Vec<OutcomeEvent>> {
        self.nodes
            .iter()
            .map(|e| (e.key().clone(), e.value().lock().window.to_vec()))
            .collect()
    }

    /// Replace histories with previously exported events
    pub fn import_history(&self, history: HashMap<String, Vec<OutcomeEvent>>) {
        let now = Utc::now();
        for (node_id, events) in history {
            let mut perf = NodePerformance::new(self.window_size);
            for event in events {
                perf.record(event);
            }
            perf.recompute(now);
            self.nodes.insert(node_id, Arc::new(Mutex::new(perf)));
        }
    }
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}
