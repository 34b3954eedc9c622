//! Learning engine: bounded decision history and per-pattern statistics
//!
//! Advisory only. Nothing in the selection path reads from here; callers
//! query [`LearningEngine::best_node_for_pattern`] for diagnostics.
//!
//! Request types come from callers, so the pattern table is capped at the
//! history limit; past that the least recently updated pattern is evicted.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use super::request::RequestPattern;
use super::strategy::Strategy;
use crate::metrics::RollingWindow;

/// Default number of decisions kept
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Samples needed before a recommendation reaches full confidence
const FULL_CONFIDENCE_SAMPLES: f64 = 10.0;

/// Immutable record of one routing attempt
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecision {
    pub timestamp: DateTime<Utc>,
    pub request_id: Uuid,
    pub pattern: RequestPattern,
    pub candidate_count: usize,
    /// `None` when no node was ever dispatched to
    pub node_id: Option<String>,
    pub success: bool,
    pub response_time_ms: u64,
    pub strategy: Strategy,
    pub fallback_used: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePatternStats {
    pub successes: u64,
    pub total: u64,
    pub average_latency_ms: f64,
}

impl NodePatternStats {
    fn record(&mut self, success: bool, latency_ms: u64) {
        self.total += 1;
        if success {
            self.successes += 1;
        }
        self.average_latency_ms += (latency_ms as f64 - self.average_latency_ms) / self.total as f64;
    }

    pub fn success_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successes as f64 / self.total as f64
        }
    }
}

/// Per-node outcomes for one request pattern
#[derive(Debug, Clone, Default, Serialize)]
pub struct PatternStats {
    pub nodes: BTreeMap<String, NodePatternStats>,
    /// Sequence number of the last decision recorded here
    #[serde(skip)]
    last_update: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecommendation {
    pub node_id: String,
    /// success ratio scaled down while few samples exist, 0.0..=1.0
    pub confidence: f64,
    pub success_rate: f64,
    pub samples: u64,
}

/// Lifetime aggregates over every routed request
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingStatistics {
    pub total_requests: u64,
    pub successful_requests: u64,
    /// Percentage, 0 when nothing has been routed
    pub success_rate: f64,
    pub fallback_count: u64,
    pub strategy_usage: BTreeMap<String, u64>,
    pub node_usage: BTreeMap<String, u64>,
    pub history_len: usize,
    /// Request patterns currently tracked
    pub pattern_count: usize,
}

#[derive(Debug)]
struct LearningState {
    history: RollingWindow<RoutingDecision>,
    patterns: HashMap<RequestPattern, PatternStats>,
    pattern_limit: usize,
    total_requests: u64,
    successful_requests: u64,
    fallback_count: u64,
    strategy_usage: BTreeMap<String, u64>,
    node_usage: BTreeMap<String, u64>,
}

#[derive(Debug)]
pub struct LearningEngine {
    state: Mutex<LearningState>,
}

impl LearningEngine {
    pub fn new(history_limit: usize) -> Self {
        Self {
            state: Mutex::new(LearningState {
                history: RollingWindow::new(history_limit),
                patterns: HashMap::new(),
                pattern_limit: history_limit.max(1),
                total_requests: 0,
                successful_requests: 0,
                fallback_count: 0,
                strategy_usage: BTreeMap::new(),
                node_usage: BTreeMap::new(),
            }),
        }
    }

    pub fn record_decision(&self, decision: RoutingDecision) {
        let mut state = self.state.lock();

        state.total_requests += 1;
        if decision.success {
            state.successful_requests += 1;
        }
        if decision.fallback_used {
            state.fallback_count += 1;
        }
        *state
            .strategy_usage
            .entry(decision.strategy.to_string())
            .or_default() += 1;

        if let Some(ref node_id) = decision.node_id {
            *state.node_usage.entry(node_id.clone()).or_default() += 1;
            let sequence = state.total_requests;
            let stats = state.patterns.entry(decision.pattern.clone()).or_default();
            stats.last_update = sequence;
            stats
                .nodes
                .entry(node_id.clone())
                .or_default()
                .record(decision.success, decision.response_time_ms);
            state.evict_stale_patterns();
        }

        state.history.push(decision);
    }

    /// Drop a removed node from usage counts and pattern statistics
    pub fn forget_node(&self, node_id: &str) {
        let mut state = self.state.lock();
        state.node_usage.remove(node_id);
        state.patterns.retain(|_, stats| {
            stats.nodes.remove(node_id);
            !stats.nodes.is_empty()
        });
    }

    /// Best node seen for a pattern: success ratio, then lower latency, then id
    pub fn best_node_for_pattern(&self, pattern: &RequestPattern) -> Option<NodeRecommendation> {
        let state = self.state.lock();
        let stats = state.patterns.get(pattern)?;

        let (node_id, best) = stats.nodes.iter().filter(|(_, s)| s.total > 0).reduce(|a, b| {
            let (ra, rb) = (a.1.success_ratio(), b.1.success_ratio());
            if rb > ra || (rb == ra && b.1.average_latency_ms < a.1.average_latency_ms) {
                b
            } else {
                a
            }
        })?;

        let ratio = best.success_ratio();
        Some(NodeRecommendation {
            node_id: node_id.clone(),
            confidence: ratio * (best.total as f64 / FULL_CONFIDENCE_SAMPLES).min(1.0),
            success_rate: ratio * 100.0,
            samples: best.total,
        })
    }

    pub fn pattern_stats(&self, pattern: &RequestPattern) -> Option<PatternStats> {
        self.state.lock().patterns.get(pattern).cloned()
    }

    /// Newest last
    pub fn recent_decisions(&self, limit: usize) -> Vec<RoutingDecision> {
        let state = self.state.lock();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn statistics(&self) -> RoutingStatistics {
        let state = self.state.lock();
        let success_rate = if state.total_requests == 0 {
            0.0
        } else {
            state.successful_requests as f64 / state.total_requests as f64 * 100.0
        };

        RoutingStatistics {
            total_requests: state.total_requests,
            successful_requests: state.successful_requests,
            success_rate,
            fallback_count: state.fallback_count,
            strategy_usage: state.strategy_usage.clone(),
            node_usage: state.node_usage.clone(),
            history_len: state.history.len(),
            pattern_count: state.patterns.len(),
        }
    }
}

impl LearningState {
    fn evict_stale_patterns(&mut self) {
        while self.patterns.len() > self.pattern_limit {
            let Some(oldest) = self
                .patterns
                .iter()
                .min_by_key(|(_, stats)| stats.last_update)
                .map(|(pattern, _)| pattern.clone())
            else {
                break;
            };
            self.patterns.remove(&oldest);
        }
    }
}

impl Default for LearningEngine {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}
