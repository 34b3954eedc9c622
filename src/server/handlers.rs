use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::config::NodeSpec;
use crate::registry::RegistryError;
use crate::routing::{
    Complexity, NodePatternStats, NodeRecommendation, RegistrationError, RequestPattern, RoutingRequest,
};
use crate::server::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub nodes: usize,
    pub healthy_nodes: usize,
    pub uptime_secs: i64,
}

/// Best node for a pattern plus the per-node outcomes it was chosen from
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternResponse {
    #[serde(flatten)]
    pub recommendation: NodeRecommendation,
    pub nodes: BTreeMap<String, NodePatternStats>,
}

#[derive(Debug, Deserialize)]
pub struct DecisionsQuery {
    pub limit: Option<usize>,
}

const DEFAULT_DECISIONS_LIMIT: usize = 20;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Liveness of the router itself, with a node summary
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let nodes = state.router.registry().all();
    let healthy_nodes = nodes.iter().filter(|n| n.status().is_healthy()).count();

    Json(HealthResponse {
        status: "ok",
        nodes: nodes.len(),
        healthy_nodes,
        uptime_secs: state.uptime_secs(),
    })
}

pub async fn list_nodes(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.router.node_status())
}

pub async fn register_node(State(state): State<AppState>, Json(spec): Json<NodeSpec>) -> Response {
    match state.router.register_node(&spec).await {
        Ok(report) => (StatusCode::CREATED, Json(report)).into_response(),
        Err(RegistrationError::Registry(e @ RegistryError::NodeExists(_))) => {
            error_response(StatusCode::CONFLICT, e.to_string())
        }
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

pub async fn remove_node(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.router.remove_node(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(StatusCode::NOT_FOUND, e.to_string()),
    }
}

pub async fn statistics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.router.routing_statistics())
}

/// Route one request; a routing failure is a bad gateway, not a server error
pub async fn route(State(state): State<AppState>, Json(request): Json<RoutingRequest>) -> Response {
    let response = state.router.route_request(request).await;
    let status = if response.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(response)).into_response()
}

pub async fn best_node(
    State(state): State<AppState>,
    Path((request_type, complexity)): Path<(String, String)>,
) -> Response {
    let Some(complexity) = Complexity::parse(&complexity) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("unknown complexity '{}'", complexity),
        );
    };

    let pattern = RequestPattern::new(request_type, complexity);
    let recommendation = state.router.best_node_for_pattern(&pattern);
    let stats = state.router.pattern_stats(&pattern);
    match (recommendation, stats) {
        (Some(recommendation), Some(stats)) => Json(PatternResponse {
            recommendation,
            nodes: stats.nodes,
        })
        .into_response(),
        _ => error_response(StatusCode::NOT_FOUND, format!("no history for {}", pattern)),
    }
}

/// Most recent routing decisions, newest last
pub async fn recent_decisions(
    State(state): State<AppState>,
    Query(query): Query<DecisionsQuery>,
) -> impl IntoResponse {
    Json(
        state
            .router
            .recent_decisions(query.limit.unwrap_or(DEFAULT_DECISIONS_LIMIT)),
    )
}

/// Create the Axum router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/nodes", get(list_nodes).post(register_node))
        .route("/nodes/{id}", delete(remove_node))
        .route("/stats", get(statistics))
        .route("/route", post(route))
        .route("/patterns/{request_type}/{complexity}", get(best_node))
        .route("/decisions", get(recent_decisions))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::mock::{MockProbe, MockProber};
    use crate::health::ProbeOutcome;
    use crate::routing::executor::mock::{MockCall, MockExecutor};
    use crate::routing::{IntelligentRouter, RouteResponse, RouterOptions};
    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn create_test_app(executor: MockExecutor) -> (Router, Arc<IntelligentRouter>) {
        let prober = MockProber::new(vec![(
            "broken",
            MockProbe::Respond(ProbeOutcome::Unhealthy { status_code: 503 }),
        )]);
        let router = Arc::new(
            IntelligentRouter::builder(RouterOptions::default())
                .prober(Arc::new(prober))
                .executor(Arc::new(executor))
                .build(),
        );
        (create_router(AppState::new(Arc::clone(&router))), router)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (app, router) = create_test_app(MockExecutor::default());
        router.register_node(&NodeSpec::new("a", "http://a.local")).await.unwrap();
        router.register_node(&NodeSpec::new("broken", "http://b.local")).await.unwrap();

        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["nodes"], 2);
        assert_eq!(body["healthyNodes"], 1);
    }

    #[tokio::test]
    async fn test_register_and_list_nodes() {
        let (app, _) = create_test_app(MockExecutor::default());

        let spec = json!({"id": "git-1", "endpoint": "http://git.local", "capabilities": ["git"]});
        let response = app.clone().oneshot(post_json("/nodes", spec.clone())).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_json(response).await["status"], "Healthy");

        let response = app.clone().oneshot(post_json("/nodes", spec)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let bad = json!({"id": "x", "endpoint": "not-a-url"});
        let response = app.clone().oneshot(post_json("/nodes", bad)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app.oneshot(get("/nodes")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["id"], "git-1");
        assert_eq!(body[0]["capabilities"][0], "git");
    }

    #[tokio::test]
    async fn test_route_success_and_stats() {
        let executor = MockExecutor::new(vec![("git-1", MockCall::Respond(json!({"branch": "main"})))]);
        let (app, router) = create_test_app(executor);
        router
            .register_node(&NodeSpec::new("git-1", "http://git.local").with_capabilities(["git"]))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(post_json("/route", json!({"type": "git-operation", "payload": {}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let routed: RouteResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(routed.success);
        assert_eq!(routed.result, Some(json!({"branch": "main"})));
        assert_eq!(routed.metadata.selected_node.as_deref(), Some("git-1"));

        let stats = body_json(app.clone().oneshot(get("/stats")).await.unwrap()).await;
        assert_eq!(stats["totalRequests"], 1);
        assert_eq!(stats["nodeUsage"]["git-1"], 1);

        let best = app.clone().oneshot(get("/patterns/git-operation/low")).await.unwrap();
        assert_eq!(best.status(), StatusCode::OK);
        let best = body_json(best).await;
        assert_eq!(best["nodeId"], "git-1");
        assert_eq!(best["nodes"]["git-1"]["total"], 1);

        let decisions = body_json(app.oneshot(get("/decisions?limit=5")).await.unwrap()).await;
        let decisions = decisions.as_array().unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0]["nodeId"], "git-1");
        assert_eq!(decisions[0]["success"], true);
    }

    #[tokio::test]
    async fn test_route_failure_is_bad_gateway() {
        let (app, _) = create_test_app(MockExecutor::default());

        let response = app
            .oneshot(post_json("/route", json!({"type": "ai-request"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["kind"], "NoCandidateNodes");
        assert_eq!(body["error"]["fallbackAttempted"], true);
    }

    #[tokio::test]
    async fn test_patterns_errors() {
        let (app, _) = create_test_app(MockExecutor::default());

        let response = app.clone().oneshot(get("/patterns/ai-request/extreme")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app.oneshot(get("/patterns/ai-request/low")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_remove_node() {
        let (app, router) = create_test_app(MockExecutor::default());
        router.register_node(&NodeSpec::new("a", "http://a.local")).await.unwrap();

        let delete = |uri: &str| {
            Request::builder()
                .method("DELETE")
                .uri(uri)
                .body(Body::empty())
                .unwrap()
        };

        let response = app.clone().oneshot(delete("/nodes/a")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app.oneshot(delete("/nodes/a")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
