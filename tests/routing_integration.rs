//! End-to-end routing against real HTTP nodes
//!
//! Each test starts thin axum servers on ephemeral ports that stand in for
//! backend nodes, then drives the router through its HTTP prober and
//! executor.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use noderoute::config::NodeSpec;
use noderoute::registry::NodeStatus;
use noderoute::routing::{
    ErrorKind, HttpMethod, IntelligentRouter, RouteResponse, RouterOptions, RoutingRequest,
};
use noderoute::server::{create_router, AppState};

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// A node that is healthy and echoes `/run` bodies tagged with its name
async fn echo_node(name: &'static str) -> SocketAddr {
    let app = Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route(
            "/run",
            post(|State(name): State<&'static str>, Json(body): Json<Value>| async move {
                Json(json!({"node": name, "echo": body}))
            }),
        )
        .with_state(name);
    serve(app).await
}

/// A node whose health endpoint answers 503
async fn unhealthy_node() -> SocketAddr {
    let app = Router::new().route("/health", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
    serve(app).await
}

/// A healthy node that takes `delay` to answer `/run`
async fn slow_node(delay: Duration) -> SocketAddr {
    let app = Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route(
            "/run",
            post(move || async move {
                tokio::time::sleep(delay).await;
                Json(json!({"late": true}))
            }),
        );
    serve(app).await
}

/// A healthy node that requires a bearer token on `/run`
async fn authenticated_node(token: &'static str) -> SocketAddr {
    let app = Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route(
            "/run",
            post(move |headers: HeaderMap| async move {
                let expected = format!("Bearer {}", token);
                match headers.get("authorization").and_then(|v| v.to_str().ok()) {
                    Some(value) if value == expected => (StatusCode::OK, Json(json!({"authorized": true}))),
                    _ => (StatusCode::UNAUTHORIZED, Json(json!({"authorized": false}))),
                }
            }),
        );
    serve(app).await
}

/// Address of a port nothing listens on
async fn closed_port() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

fn url(addr: SocketAddr) -> String {
    format!("http://{}", addr)
}

fn router() -> IntelligentRouter {
    let mut options = RouterOptions::default();
    options.health.probe_timeout = Duration::from_secs(2);
    IntelligentRouter::builder(options).build()
}

fn run_request(request_type: &str, payload: Value) -> RoutingRequest {
    RoutingRequest::new(request_type, payload).with_path(HttpMethod::Post, "/run")
}

#[tokio::test]
async fn test_http_health_probe_classification() {
    let healthy = echo_node("a").await;
    let unhealthy = unhealthy_node().await;
    let closed = closed_port().await;

    let router = router();
    let report = router
        .register_nodes(&[
            NodeSpec::new("healthy", url(healthy)),
            NodeSpec::new("unhealthy", url(unhealthy)),
            NodeSpec::new("unreachable", url(closed)),
        ])
        .await
        .unwrap();

    assert_eq!(report.healthy, 1);
    assert_eq!(report.unhealthy, 1);
    assert_eq!(report.unreachable, 1);

    let statuses: Vec<(String, NodeStatus)> = router
        .node_status()
        .into_iter()
        .map(|r| (r.id, r.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("healthy".to_string(), NodeStatus::Healthy),
            ("unhealthy".to_string(), NodeStatus::Unhealthy),
            ("unreachable".to_string(), NodeStatus::Unreachable),
        ]
    );
}

#[tokio::test]
async fn test_routes_by_capability_over_http() {
    let git = echo_node("git").await;
    let ai = echo_node("ai").await;

    let router = router();
    router
        .register_node(&NodeSpec::new("git-node", url(git)).with_capabilities(["git"]))
        .await
        .unwrap();
    router
        .register_node(&NodeSpec::new("ai-node", url(ai)).with_capabilities(["ai", "code-completion"]))
        .await
        .unwrap();

    let response = router
        .route_request(run_request("git-operation", json!({"op": "log"})))
        .await;

    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.metadata.selected_node.as_deref(), Some("git-node"));
    assert_eq!(
        response.result,
        Some(json!({"node": "git", "echo": {"op": "log"}}))
    );

    let git_report = router
        .node_status()
        .into_iter()
        .find(|r| r.id == "git-node")
        .unwrap();
    assert_eq!(git_report.requests.successful_requests, 1);
    assert_eq!(git_report.current_load, 0);
    assert_eq!(git_report.metrics.total_successes, 1);
}

#[tokio::test]
async fn test_unhealthy_node_is_skipped() {
    let down = unhealthy_node().await;
    let up = echo_node("up").await;

    let router = router();
    router
        .register_nodes(&[
            NodeSpec::new("down", url(down)).with_priority(1),
            NodeSpec::new("up", url(up)).with_priority(5),
        ])
        .await
        .unwrap();

    let response = router.route_request(run_request("anything", json!({}))).await;
    assert!(response.success);
    assert_eq!(response.metadata.selected_node.as_deref(), Some("up"));
    assert_eq!(response.metadata.candidate_count, 1);
}

#[tokio::test]
async fn test_timeout_surfaces_request_timeout() {
    let slow = slow_node(Duration::from_secs(5)).await;

    let router = router();
    router
        .register_node(&NodeSpec::new("slow", url(slow)).with_timeout_ms(200))
        .await
        .unwrap();

    let response = router.route_request(run_request("anything", json!({}))).await;

    assert!(!response.success);
    let error = response.error.unwrap();
    assert_eq!(error.kind, ErrorKind::RequestTimeout);
    assert!(error.fallback_attempted);

    let reports = router.node_status();
    assert_eq!(reports[0].requests.failed_requests, 2);
    assert_eq!(reports[0].current_load, 0);
}

#[tokio::test]
async fn test_fallback_after_transport_failure() {
    let good = echo_node("good").await;

    let router = router();
    router
        .register_nodes(&[
            NodeSpec::new("flaky", url(good)).with_capabilities(["search"]).with_priority(1),
            NodeSpec::new("good", url(good)).with_priority(5),
        ])
        .await
        .unwrap();

    // flaky answers /health but has no /missing route
    let request = RoutingRequest::new("search-request", json!({})).with_path(HttpMethod::Post, "/missing");
    let response = router.route_request(request).await;

    // both attempts hit 404s: the fallback went to the other node
    assert!(!response.success);
    let error = response.error.unwrap();
    assert_eq!(error.kind, ErrorKind::TransportError);
    assert!(error.fallback_attempted);
    assert_eq!(response.metadata.selected_node.as_deref(), Some("good"));
}

#[tokio::test]
async fn test_bearer_key_forwarded() {
    let secured = authenticated_node("s3cret").await;

    let router = router();
    let mut spec = NodeSpec::new("secured", url(secured));
    spec.api_key = Some("s3cret".to_string());
    router.register_node(&spec).await.unwrap();

    let response = router.route_request(run_request("anything", json!({}))).await;
    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.result, Some(json!({"authorized": true})));
}

#[tokio::test]
async fn test_router_http_surface() {
    let node = echo_node("n1").await;

    let router = Arc::new(router());
    let addr = serve(create_router(AppState::new(Arc::clone(&router)))).await;
    let client = reqwest::Client::new();

    let created = client
        .post(format!("{}/nodes", url(addr)))
        .json(&json!({"id": "n1", "endpoint": url(node), "capabilities": ["memory"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status().as_u16(), 201);

    let routed = client
        .post(format!("{}/route", url(addr)))
        .json(&json!({"type": "memory-operation", "payload": {"key": "k"}, "path": "/run"}))
        .send()
        .await
        .unwrap();
    assert_eq!(routed.status().as_u16(), 200);
    let body: RouteResponse = routed.json().await.unwrap();
    assert_eq!(body.result, Some(json!({"node": "n1", "echo": {"key": "k"}})));

    let stats: Value = client
        .get(format!("{}/stats", url(addr)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["totalRequests"], 1);
    assert_eq!(stats["successRate"], 100.0);
}
