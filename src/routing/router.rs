//! The intelligent router: analyze, filter, score, select, execute, fall back
//!
//! All shared state lives in the registry (per-node atomics and locks), the
//! performance tracker (per-node mutex) and the learning engine. Concurrent
//! `route_request` calls never serialize on a router-wide lock.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{ErrorKind, RoutingError};
use super::executor::{Execution, ExecutionEngine, HttpExecutor, NetworkExecutor};
use super::filter::filter_candidates;
use super::learning::{
    LearningEngine, NodeRecommendation, PatternStats, RoutingDecision, RoutingStatistics, DEFAULT_HISTORY_LIMIT,
};
use super::request::{RequestPattern, RoutingRequest};
use super::requirement::{Requirement, RequirementAnalyzer, RequirementClassifier, DEFAULT_REQUEST_TIMEOUT};
use super::scoring::score_candidates;
use super::strategy::{NodeSelector, Strategy, StrategySelector};
use crate::config::{validate_node_spec, ConfigError, NodeSpec, RouterConfig};
use crate::health::{HealthConfig, HealthMonitor, HealthProber, HealthSweepReport};
use crate::metrics::{PerformanceMetrics, PerformanceTracker, DEFAULT_WINDOW_SIZE};
use crate::registry::{Node, NodeRegistry, NodeStatus, RegistryError, RequestCounters};

// ============================================================================
// Options and construction
// ============================================================================

#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub default_strategy: Strategy,
    pub history_limit: usize,
    pub default_timeout: Duration,
    pub classifier_timeout: Duration,
    pub selector_timeout: Duration,
    pub health: HealthConfig,
    pub window_size: usize,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            default_strategy: Strategy::Hybrid,
            history_limit: DEFAULT_HISTORY_LIMIT,
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            classifier_timeout: Duration::from_secs(3),
            selector_timeout: Duration::from_secs(3),
            health: HealthConfig::default(),
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }
}

impl From<&RouterConfig> for RouterOptions {
    fn from(config: &RouterConfig) -> Self {
        let router = &config.router;
        Self {
            default_strategy: Strategy::resolve(&router.default_strategy),
            history_limit: router.history_limit,
            default_timeout: Duration::from_millis(router.default_timeout_ms),
            classifier_timeout: Duration::from_millis(router.classifier_timeout_ms),
            selector_timeout: Duration::from_millis(router.selector_timeout_ms),
            health: HealthConfig::from(&config.health),
            window_size: config.metrics.window_size,
        }
    }
}

/// Assembles an [`IntelligentRouter`]; collaborators left unset get their
/// HTTP implementation (or none, for the optional classifier and selector)
#[derive(Default)]
pub struct RouterBuilder {
    options: RouterOptions,
    prober: Option<Arc<dyn HealthProber>>,
    executor: Option<Arc<dyn NetworkExecutor>>,
    classifier: Option<Arc<dyn RequirementClassifier>>,
    node_selector: Option<Arc<dyn NodeSelector>>,
    tracker: Option<Arc<PerformanceTracker>>,
}

impl RouterBuilder {
    pub fn new(options: RouterOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn prober(mut self, prober: Arc<dyn HealthProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn NetworkExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn RequirementClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn node_selector(mut self, selector: Arc<dyn NodeSelector>) -> Self {
        self.node_selector = Some(selector);
        self
    }

    /// Share an existing tracker, e.g. one restored from a snapshot
    pub fn tracker(mut self, tracker: Arc<PerformanceTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn build(self) -> IntelligentRouter {
        let options = self.options;
        let registry = NodeRegistry::new();

        let health = match self.prober {
            Some(prober) => HealthMonitor::new(registry.clone(), prober, options.health.clone()),
            None => HealthMonitor::with_http(registry.clone(), options.health.clone()),
        };

        let tracker = self
            .tracker
            .unwrap_or_else(|| Arc::new(PerformanceTracker::new(options.window_size)));

        let executor = self.executor.unwrap_or_else(|| Arc::new(HttpExecutor::new()));
        let engine = ExecutionEngine::new(executor, Arc::clone(&tracker));

        let mut analyzer = RequirementAnalyzer::new(options.default_strategy, options.default_timeout);
        if let Some(classifier) = self.classifier {
            analyzer = analyzer.with_classifier(classifier, options.classifier_timeout);
        }

        let mut strategies = StrategySelector::new();
        if let Some(selector) = self.node_selector {
            strategies = strategies.with_node_selector(selector, options.selector_timeout);
        }

        IntelligentRouter {
            registry,
            health,
            tracker,
            analyzer,
            strategies,
            engine,
            learning: LearningEngine::new(options.history_limit),
        }
    }
}

// ============================================================================
// Public result types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteFailure {
    /// Kind of the error that started the failure
    pub kind: ErrorKind,
    pub message: String,
    pub fallback_attempted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMetadata {
    pub request_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_node: Option<String>,
    pub response_time_ms: u64,
    pub strategy: Strategy,
    /// Suitability of the chosen node, 0.0..=1.0
    pub confidence: f64,
    pub fallback_used: bool,
    pub candidate_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RouteFailure>,
    pub metadata: RouteMetadata,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatusReport {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    pub status: NodeStatus,
    pub capabilities: Vec<String>,
    pub tags: Vec<String>,
    pub priority: u32,
    pub current_load: u32,
    pub max_concurrency: u32,
    pub timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub requests: RequestCounters,
    pub metrics: PerformanceMetrics,
}

impl NodeStatusReport {
    fn from_node(node: &Node, metrics: PerformanceMetrics) -> Self {
        Self {
            id: node.id.clone(),
            name: node.name.clone(),
            endpoint: node.endpoint.clone(),
            status: node.status(),
            capabilities: node.capabilities.clone(),
            tags: node.tags.clone(),
            priority: node.priority,
            current_load: node.current_load(),
            max_concurrency: node.max_concurrency,
            timeout_ms: node.timeout.as_millis() as u64,
            last_health_check: node.last_health_check(),
            last_error: node.last_error(),
            requests: node.counters(),
            metrics,
        }
    }
}

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error(transparent)]
    Invalid(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

// ============================================================================
// Router
// ============================================================================

/// The parts of an attempt reported back to the caller
struct AttemptMeta {
    node_id: Option<String>,
    strategy: Strategy,
    confidence: f64,
}

/// One pass of filter, score, select and execute
struct Attempt {
    meta: AttemptMeta,
    candidate_count: usize,
    outcome: Result<Execution, RoutingError>,
}

pub struct IntelligentRouter {
    registry: NodeRegistry,
    health: HealthMonitor,
    tracker: Arc<PerformanceTracker>,
    analyzer: RequirementAnalyzer,
    strategies: StrategySelector,
    engine: ExecutionEngine,
    learning: LearningEngine,
}

impl IntelligentRouter {
    pub fn builder(options: RouterOptions) -> RouterBuilder {
        RouterBuilder::new(options)
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> Arc<PerformanceTracker> {
        Arc::clone(&self.tracker)
    }

    /// Handle for running periodic sweeps in the background
    pub fn health_monitor(&self) -> HealthMonitor {
        self.health.clone()
    }

    /// Register a node and probe it once before returning
    pub async fn register_node(&self, spec: &NodeSpec) -> Result<NodeStatusReport, RegistrationError> {
        validate_node_spec(spec)?;
        let node = self.registry.register_spec(spec)?;
        let status = self.health.check_node(&node).await;
        info!("Registered node {} ({}): {:?}", node.id, node.endpoint, status);
        Ok(NodeStatusReport::from_node(&node, self.tracker.metrics(&node.id)))
    }

    /// Register many nodes, then probe them concurrently.
    ///
    /// The whole batch is validated before anything is inserted. If a
    /// concurrent registration still takes one of the ids, the nodes already
    /// inserted are probed before the error is returned.
    pub async fn register_nodes(&self, specs: &[NodeSpec]) -> Result<HealthSweepReport, RegistrationError> {
        let mut seen = HashSet::new();
        for spec in specs {
            validate_node_spec(spec)?;
            if !seen.insert(spec.id.as_str()) || self.registry.get(&spec.id).is_some() {
                return Err(RegistryError::NodeExists(spec.id.clone()).into());
            }
        }

        let mut inserted = Vec::with_capacity(specs.len());
        let mut conflict = None;
        for spec in specs {
            match self.registry.register_spec(spec) {
                Ok(node) => inserted.push(node),
                Err(e) => {
                    conflict = Some(e);
                    break;
                }
            }
        }

        let report = self.health.check_nodes(inserted).await;
        if let Some(e) = conflict {
            warn!("Batch registration stopped early: {}", e);
            return Err(e.into());
        }
        info!(
            "Registered {} nodes: {} healthy, {} unhealthy, {} unreachable",
            specs.len(),
            report.healthy,
            report.unhealthy,
            report.unreachable
        );
        Ok(report)
    }

    pub fn remove_node(&self, id: &str) -> Result<(), RegistryError> {
        self.registry.remove(id)?;
        self.tracker.forget(id);
        self.learning.forget_node(id);
        info!("Removed node {}", id);
        Ok(())
    }

    pub async fn check_health(&self) -> HealthSweepReport {
        self.health.check_all().await
    }

    pub async fn route_request(&self, request: RoutingRequest) -> RouteResponse {
        let started = Instant::now();
        let requirement = self.analyzer.analyze(&request).await;
        debug!(
            "Request {} ({}): capabilities={:?} strategy={} priority={}",
            request.id, request.request_type, requirement.capabilities, requirement.strategy, requirement.priority
        );

        let Attempt {
            meta: primary,
            candidate_count,
            outcome,
        } = self.attempt(&request, &requirement, None).await;

        let (last, outcome, fallback_attempted, fallback_error) = match outcome {
            Ok(execution) => (primary, Ok(execution), false, None),
            Err(err) if !requirement.retryable => (primary, Err(err), false, None),
            Err(err) => {
                warn!("Primary routing for {} failed: {}; trying fallback", request.id, err);
                let fallback = self
                    .attempt(&request, &requirement.relaxed(), primary.node_id.as_deref())
                    .await;

                match fallback.outcome {
                    Ok(execution) => (fallback.meta, Ok(execution), true, None),
                    Err(fallback_err) => {
                        let message = fallback_err.to_string();
                        let last = if fallback.meta.node_id.is_some() {
                            fallback.meta
                        } else {
                            primary
                        };
                        let combined = RoutingError::AllFallbackFailed {
                            primary: Box::new(err),
                            fallback: Box::new(fallback_err),
                        };
                        (last, Err(combined), true, Some(message))
                    }
                }
            }
        };

        let response_time_ms = started.elapsed().as_millis() as u64;
        let success = outcome.is_ok();

        self.learning.record_decision(RoutingDecision {
            timestamp: Utc::now(),
            request_id: request.id,
            pattern: request.pattern(),
            candidate_count,
            node_id: last.node_id.clone(),
            success,
            response_time_ms,
            strategy: last.strategy,
            fallback_used: fallback_attempted,
        });

        let metadata = RouteMetadata {
            request_id: request.id,
            selected_node: last.node_id,
            response_time_ms,
            strategy: last.strategy,
            confidence: last.confidence,
            fallback_used: fallback_attempted,
            candidate_count,
        };

        match outcome {
            Ok(execution) => {
                debug!(
                    "Request {} served by {} in {}ms",
                    request.id,
                    execution.node_id,
                    execution.response_time.as_millis()
                );
                RouteResponse {
                    success: true,
                    result: Some(execution.response),
                    error: None,
                    metadata,
                }
            }
            Err(err) => {
                warn!("Request {} failed: {}", request.id, err);
                RouteResponse {
                    success: false,
                    result: None,
                    error: Some(RouteFailure {
                        kind: err.root_cause().kind(),
                        message: err.to_string(),
                        fallback_attempted,
                        fallback_error,
                    }),
                    metadata,
                }
            }
        }
    }

    /// Filter, score, select and execute once. `avoid` is skipped when any
    /// other candidate remains.
    async fn attempt(&self, request: &RoutingRequest, requirement: &Requirement, avoid: Option<&str>) -> Attempt {
        let nodes = self.registry.all();
        let mut candidates = filter_candidates(&nodes, requirement, &self.tracker);

        if let Some(avoid) = avoid {
            if candidates.iter().any(|c| c.node.id != avoid) {
                candidates.retain(|c| c.node.id != avoid);
            }
        }

        let candidate_count = candidates.len();
        let no_candidates = || Attempt {
            meta: AttemptMeta {
                node_id: None,
                strategy: requirement.strategy,
                confidence: 0.0,
            },
            candidate_count,
            outcome: Err(RoutingError::NoCandidateNodes),
        };

        if candidates.is_empty() {
            debug!("No candidates among {} nodes for {}", nodes.len(), request.id);
            return no_candidates();
        }

        let scored = score_candidates(candidates, requirement);
        let Some(selection) = self
            .strategies
            .select(requirement.strategy, &scored, requirement)
            .await
        else {
            return no_candidates();
        };

        let chosen = &scored[selection.index];
        debug!(
            "Strategy {} picked {} (score {:.1}) from {} candidates",
            selection.strategy,
            chosen.id(),
            chosen.score.total,
            candidate_count
        );

        let node = Arc::clone(&chosen.candidate.node);
        let outcome = self.engine.execute(&node, request, requirement).await;

        Attempt {
            meta: AttemptMeta {
                node_id: Some(node.id.clone()),
                strategy: selection.strategy,
                confidence: chosen.score.total / 100.0,
            },
            candidate_count,
            outcome,
        }
    }

    /// Per-node status and metrics, ordered by id
    pub fn node_status(&self) -> Vec<NodeStatusReport> {
        self.registry
            .all()
            .iter()
            .map(|node| NodeStatusReport::from_node(node, self.tracker.metrics(&node.id)))
            .collect()
    }

    pub fn routing_statistics(&self) -> RoutingStatistics {
        self.learning.statistics()
    }

    /// Advisory; not consulted when routing
    pub fn best_node_for_pattern(&self, pattern: &RequestPattern) -> Option<NodeRecommendation> {
        self.learning.best_node_for_pattern(pattern)
    }

    /// Per-node outcomes behind [`best_node_for_pattern`](Self::best_node_for_pattern)
    pub fn pattern_stats(&self, pattern: &RequestPattern) -> Option<PatternStats> {
        self.learning.pattern_stats(pattern)
    }

    /// Newest last
    pub fn recent_decisions(&self, limit: usize) -> Vec<RoutingDecision> {
        self.learning.recent_decisions(limit)
    }
}
