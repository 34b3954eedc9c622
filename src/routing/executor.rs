//! Execution engine: dispatch a request to one node under a deadline
//!
//! A concurrency slot is reserved before dispatch and released by the
//! [`LoadGuard`](crate::registry::LoadGuard) drop on every exit path. The
//! network future and the deadline race in `tokio::time::timeout`; when the
//! deadline wins the network future is dropped, which cancels the call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::error::RoutingError;
use super::request::{HttpMethod, RoutingRequest};
use super::requirement::Requirement;
use crate::metrics::PerformanceTracker;
use crate::registry::Node;

/// One call to a node endpoint
#[derive(Debug, Clone)]
pub struct NodeCall {
    pub method: HttpMethod,
    pub path: String,
    pub body: Value,
    pub timeout: Duration,
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response body: {0}")]
    Parse(String),

    #[error("Call timed out")]
    Timeout,
}

#[async_trait]
pub trait NetworkExecutor: Send + Sync {
    async fn execute(&self, node: &Node, call: &NodeCall) -> Result<Value, ExecutorError>;
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

#[derive(Clone, Default)]
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

fn join_url(endpoint: &str, path: &str) -> String {
    if path.is_empty() || path == "/" {
        format!("{}/", endpoint)
    } else if path.starts_with('/') {
        format!("{}{}", endpoint, path)
    } else {
        format!("{}/{}", endpoint, path)
    }
}

#[async_trait]
impl NetworkExecutor for HttpExecutor {
    async fn execute(&self, node: &Node, call: &NodeCall) -> Result<Value, ExecutorError> {
        let url = join_url(&node.endpoint, &call.path);

        let mut req = match call.method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Put => self.client.put(&url),
            HttpMethod::Patch => self.client.patch(&url),
            HttpMethod::Delete => self.client.delete(&url),
        }
        .timeout(call.timeout);

        if call.method != HttpMethod::Get && !call.body.is_null() {
            req = req.json(&call.body);
        }
        if let Some(ref key) = node.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ExecutorError::Timeout
            } else {
                ExecutorError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ExecutorError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(ExecutorError::Api {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| ExecutorError::Parse(e.to_string()))
    }
}

// ============================================================================
// Engine
// ============================================================================

/// A successful dispatch
#[derive(Debug, Clone)]
pub struct Execution {
    pub node_id: String,
    pub response: Value,
    pub response_time: Duration,
}

#[derive(Clone)]
pub struct ExecutionEngine {
    executor: Arc<dyn NetworkExecutor>,
    tracker: Arc<PerformanceTracker>,
}

impl ExecutionEngine {
    pub fn new(executor: Arc<dyn NetworkExecutor>, tracker: Arc<PerformanceTracker>) -> Self {
        Self { executor, tracker }
    }

    /// Effective deadline for a call: the tighter of node and request limits
    pub fn deadline(node: &Node, requirement: &Requirement) -> Duration {
        node.timeout.min(requirement.timeout)
    }

    pub async fn execute(
        &self,
        node: &Arc<Node>,
        request: &RoutingRequest,
        requirement: &Requirement,
    ) -> Result<Execution, RoutingError> {
        let _slot = node
            .try_acquire()
            .ok_or_else(|| RoutingError::CapacityExhausted(node.id.clone()))?;

        let deadline = Self::deadline(node, requirement);
        let call = NodeCall {
            method: request.method,
            path: request.path.clone(),
            body: request.payload.clone(),
            timeout: deadline,
        };

        debug!(
            "Dispatching {} {} to {} (deadline {}ms)",
            call.method.as_str(),
            call.path,
            node.id,
            deadline.as_millis()
        );

        let started = Instant::now();
        let result = match timeout(deadline, self.executor.execute(node, &call)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(ExecutorError::Timeout)) | Err(_) => Err(RoutingError::RequestTimeout {
                node: node.id.clone(),
                timeout_ms: deadline.as_millis() as u64,
            }),
            Ok(Err(e)) => Err(RoutingError::Transport {
                node: node.id.clone(),
                message: e.to_string(),
            }),
        };
        let elapsed = started.elapsed();

        let success = result.is_ok();
        if self
            .tracker
            .record_outcome_if(&node.id, success, elapsed, || !node.is_retired())
            .is_none()
        {
            debug!("Node {} was removed mid-call; outcome not tracked", node.id);
        }
        node.record_completion(success, elapsed);

        match result {
            Ok(response) => Ok(Execution {
                node_id: node.id.clone(),
                response,
                response_time: elapsed,
            }),
            Err(e) => {
                warn!("Call to {} failed after {}ms: {}", node.id, elapsed.as_millis(), e);
                Err(e)
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{MockCall, MockExecutor};
    use super::*;
    use crate::config::NodeSpec;
    use crate::routing::requirement::Priority;
    use crate::routing::strategy::Strategy;
    use serde_json::json;

    fn node(id: &str, max: u32, timeout_ms: u64) -> Arc<Node> {
        let spec = NodeSpec::new(id, format!("http://{}.local", id))
            .with_max_concurrency(max)
            .with_timeout_ms(timeout_ms);
        Arc::new(Node::from_spec(&spec))
    }

    fn requirement(timeout: Duration) -> Requirement {
        Requirement {
            capabilities: vec![],
            strategy: Strategy::Hybrid,
            priority: Priority::Medium,
            timeout,
            retryable: true,
        }
    }

    fn engine(executor: MockExecutor) -> (ExecutionEngine, Arc<PerformanceTracker>) {
        let tracker = Arc::new(PerformanceTracker::default());
        (ExecutionEngine::new(Arc::new(executor), Arc::clone(&tracker)), tracker)
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://a", "/"), "http://a/");
        assert_eq!(join_url("http://a", "/v1/run"), "http://a/v1/run");
        assert_eq!(join_url("http://a", "v1/run"), "http://a/v1/run");
    }

    #[test]
    fn test_deadline_is_tighter_limit() {
        let n = node("a", 1, 500);
        assert_eq!(
            ExecutionEngine::deadline(&n, &requirement(Duration::from_secs(30))),
            Duration::from_millis(500)
        );
        assert_eq!(
            ExecutionEngine::deadline(&n, &requirement(Duration::from_millis(100))),
            Duration::from_millis(100)
        );
    }

    #[tokio::test]
    async fn test_success_records_metrics_and_releases_slot() {
        let (engine, tracker) = engine(MockExecutor::new(vec![("a", MockCall::Respond(json!({"ok": true})))]));
        let n = node("a", 1, 1000);
        let req = RoutingRequest::new("x", json!({}));

        let out = engine.execute(&n, &req, &requirement(Duration::from_secs(1))).await.unwrap();

        assert_eq!(out.node_id, "a");
        assert_eq!(out.response, json!({"ok": true}));
        assert_eq!(n.current_load(), 0);
        assert_eq!(n.counters().successful_requests, 1);
        assert_eq!(tracker.metrics("a").total_successes, 1);
    }

    #[tokio::test]
    async fn test_transport_failure() {
        let (engine, tracker) = engine(MockExecutor::new(vec![("a", MockCall::Fail("reset".into()))]));
        let n = node("a", 1, 1000);

        let err = engine
            .execute(&n, &RoutingRequest::new("x", json!({})), &requirement(Duration::from_secs(1)))
            .await
            .unwrap_err();

        assert!(matches!(err, RoutingError::Transport { ref node, .. } if node == "a"));
        assert_eq!(n.current_load(), 0);
        assert_eq!(n.counters().failed_requests, 1);
        assert_eq!(tracker.metrics("a").total_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let (engine, _) = engine(MockExecutor::new(vec![(
            "slow",
            MockCall::Delay(Duration::from_secs(10), json!(null)),
        )]));
        let n = node("slow", 2, 200);

        let err = engine
            .execute(&n, &RoutingRequest::new("x", json!({})), &requirement(Duration::from_secs(5)))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            RoutingError::RequestTimeout {
                node: "slow".into(),
                timeout_ms: 200
            }
        );
        assert_eq!(n.current_load(), 0);
        assert_eq!(n.counters().failed_requests, 1);
    }

    #[tokio::test]
    async fn test_full_node_rejected_before_dispatch() {
        let executor = MockExecutor::new(vec![]);
        let (engine, _) = engine(executor);
        let n = node("a", 1, 1000);
        let _held = n.try_acquire().unwrap();

        let err = engine
            .execute(&n, &RoutingRequest::new("x", json!({})), &requirement(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert_eq!(err, RoutingError::CapacityExhausted("a".into()));
        assert_eq!(n.counters().total_requests, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_load_never_exceeds_max_under_contention() {
        let executor = Arc::new(MockExecutor::new(vec![(
            "a",
            MockCall::Delay(Duration::from_millis(20), json!(1)),
        )]));
        let tracker = Arc::new(PerformanceTracker::default());
        let engine = ExecutionEngine::new(executor.clone(), tracker);
        let n = node("a", 3, 1000);

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let engine = engine.clone();
            let n = Arc::clone(&n);
            tasks.push(tokio::spawn(async move {
                let req = RoutingRequest::new("x", json!({}));
                engine.execute(&n, &req, &requirement(Duration::from_secs(1))).await
            }));
        }
        for result in futures::future::join_all(tasks).await {
            let _ = result.unwrap();
        }

        assert!(executor.peak_in_flight() <= 3);
        assert_eq!(n.current_load(), 0);
        let c = n.counters();
        assert_eq!(c.total_requests as usize, executor.call_count());
    }
}
