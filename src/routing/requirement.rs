//! Requirement analysis: turn a request into what the router must satisfy
//!
//! A [`RequirementClassifier`] is asked first; [`HeuristicClassifier`] is
//! used when none is configured. The answer is advisory: a timeout, an error
//! or an unparsable answer all fall back to [`heuristic_requirement`], which
//! never fails.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::request::RoutingRequest;
use super::strategy::Strategy;
use crate::client::{ChatCompletionRequest, ClientError, OpenAiClientTrait};

/// Default per-request deadline when nothing else sets one
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// First `{` through last `}` of a model answer
static JSON_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid JSON block pattern"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// Factor applied to a node's suitability score
    pub fn multiplier(self) -> f64 {
        match self {
            Priority::Low => 0.8,
            Priority::Medium => 1.0,
            Priority::High => 1.2,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" | "normal" => Ok(Priority::Medium),
            "high" | "urgent" => Ok(Priority::High),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        };
        f.write_str(s)
    }
}

/// What a request needs from the node that serves it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    pub capabilities: Vec<String>,
    pub strategy: Strategy,
    pub priority: Priority,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub retryable: bool,
}

impl Requirement {
    /// Requirement used by the single fallback attempt
    pub fn relaxed(&self) -> Self {
        Self {
            capabilities: Vec::new(),
            strategy: Strategy::Load,
            priority: Priority::Low,
            timeout: self.timeout,
            retryable: false,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

// ============================================================================
// Classifier seam
// ============================================================================

/// Structured answer of a classifier; every field is optional except the
/// capability list
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    #[serde(default, alias = "required_capabilities", alias = "capabilities")]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default, alias = "timeout_ms", alias = "timeoutMs")]
    pub timeout: Option<u64>,
}

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Empty response from classifier")]
    EmptyResponse,

    #[error("Unparsable classifier output: {0}")]
    Unparsable(String),
}

#[async_trait]
pub trait RequirementClassifier: Send + Sync {
    async fn classify(&self, request: &RoutingRequest) -> Result<Classification, ClassifierError>;
}

// ============================================================================
// SBIO: Pure functions
// ============================================================================

/// Capabilities for well-known request types
fn capabilities_for_type(request_type: &str) -> Option<&'static [&'static str]> {
    let caps: &'static [&'static str] = match request_type {
        "git-operation" => &["git"],
        "ai-request" => &["ai", "code-completion"],
        "memory-operation" => &["memory"],
        "file-operation" => &["filesystem"],
        "search-request" => &["search"],
        "database-query" => &["database"],
        _ => return None,
    };
    Some(caps)
}

/// Keyword scan for request types outside the table
fn capabilities_by_keyword(request_type: &str) -> Vec<String> {
    let lower = request_type.to_ascii_lowercase();
    let mut caps = Vec::new();

    if lower.contains("git") {
        caps.push("git");
    }
    if lower.split(|c: char| !c.is_ascii_alphanumeric()).any(|w| w == "ai") {
        caps.push("ai");
    }
    if lower.contains("memory") {
        caps.push("memory");
    }
    if lower.contains("file") {
        caps.push("filesystem");
    }
    if lower.contains("search") {
        caps.push("search");
    }
    if lower.contains("database") || lower.contains("sql") {
        caps.push("database");
    }

    caps.into_iter().map(String::from).collect()
}

/// Type table first, keyword scan for everything else
pub fn heuristic_capabilities(request_type: &str) -> Vec<String> {
    match capabilities_for_type(request_type) {
        Some(caps) => caps.iter().map(|c| c.to_string()).collect(),
        None => capabilities_by_keyword(request_type),
    }
}

/// Deterministic requirement derived from the request alone. Never fails.
pub fn heuristic_requirement(
    request: &RoutingRequest,
    default_strategy: Strategy,
    default_timeout: Duration,
) -> Requirement {
    Requirement {
        capabilities: heuristic_capabilities(&request.request_type),
        strategy: default_strategy,
        priority: Priority::Medium,
        timeout: default_timeout,
        retryable: true,
    }
}

/// Caller hints take precedence over anything inferred
fn apply_request_hints(mut requirement: Requirement, request: &RoutingRequest) -> Requirement {
    if let Some(priority) = request.priority {
        requirement.priority = priority;
    }
    if let Some(ref name) = request.strategy {
        requirement.strategy = Strategy::resolve(name);
    }
    requirement
}

/// Fold a classifier answer over the heuristic baseline
fn merge_classification(mut base: Requirement, classification: Classification) -> Requirement {
    base.capabilities = classification.required_capabilities;
    if let Some(ref name) = classification.strategy {
        base.strategy = Strategy::resolve(name);
    }
    if let Some(priority) = classification
        .priority
        .as_deref()
        .and_then(|p| p.parse::<Priority>().ok())
    {
        base.priority = priority;
    }
    if let Some(ms) = classification.timeout.filter(|ms| *ms > 0) {
        base.timeout = Duration::from_millis(ms);
    }
    base
}

pub fn build_classification_prompt(request: &RoutingRequest) -> String {
    let payload = serde_json::to_string(&request.payload).unwrap_or_else(|_| "null".to_string());
    let context = serde_json::to_string(&request.context).unwrap_or_else(|_| "{}".to_string());

    format!(
        "Request type: {}\nPayload: {}\nContext: {}\n\n\
         Reply with ONLY a JSON object of the form \
         {{\"requiredCapabilities\": [string], \"strategy\": \
         \"performance|capability|load|external|hybrid\", \
         \"priority\": \"low|medium|high\", \"timeout\": milliseconds}}",
        request.request_type, payload, context
    )
}

/// Pull the first `{...}` block out of a model answer and decode it
pub fn parse_classification(response: &str) -> Result<Classification, ClassifierError> {
    let response = response.trim();
    if response.is_empty() {
        return Err(ClassifierError::EmptyResponse);
    }

    let block = JSON_BLOCK
        .find(response)
        .ok_or_else(|| ClassifierError::Unparsable(response.to_string()))?;

    serde_json::from_str(block.as_str()).map_err(|e| ClassifierError::Unparsable(e.to_string()))
}

/// Classifier that answers from the capability table alone; the default
/// when no model endpoint is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicClassifier;

#[async_trait]
impl RequirementClassifier for HeuristicClassifier {
    async fn classify(&self, request: &RoutingRequest) -> Result<Classification, ClassifierError> {
        Ok(Classification {
            required_capabilities: heuristic_capabilities(&request.request_type),
            ..Classification::default()
        })
    }
}

// ============================================================================
// SBIO: I/O implementation
// ============================================================================

const CLASSIFIER_SYSTEM_PROMPT: &str =
    "You classify backend requests for a router. Answer with JSON only.";

/// Classifier backed by a chat-completion model
pub struct LlmClassifier<C: OpenAiClientTrait> {
    client: C,
    model: String,
}

impl<C: OpenAiClientTrait> LlmClassifier<C> {
    pub fn new(client: C, model: String) -> Self {
        Self { client, model }
    }
}

#[async_trait]
impl<C: OpenAiClientTrait> RequirementClassifier for LlmClassifier<C> {
    async fn classify(&self, request: &RoutingRequest) -> Result<Classification, ClassifierError> {
        let chat = ChatCompletionRequest::for_decision(
            self.model.clone(),
            CLASSIFIER_SYSTEM_PROMPT,
            build_classification_prompt(request),
            200,
        );
        let response = self.client.chat_completion(&chat).await?;
        parse_classification(response.first_content().unwrap_or_default())
    }
}

// ============================================================================
// Analyzer
// ============================================================================

#[derive(Clone)]
pub struct RequirementAnalyzer {
    classifier: Arc<dyn RequirementClassifier>,
    classifier_timeout: Duration,
    default_strategy: Strategy,
    default_timeout: Duration,
}

impl RequirementAnalyzer {
    pub fn new(default_strategy: Strategy, default_timeout: Duration) -> Self {
        Self {
            classifier: Arc::new(HeuristicClassifier),
            classifier_timeout: Duration::from_secs(3),
            default_strategy,
            default_timeout,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn RequirementClassifier>, deadline: Duration) -> Self {
        self.classifier = classifier;
        self.classifier_timeout = deadline;
        self
    }

    pub async fn analyze(&self, request: &RoutingRequest) -> Requirement {
        let base = heuristic_requirement(request, self.default_strategy, self.default_timeout);

        let requirement = match timeout(self.classifier_timeout, self.classifier.classify(request)).await {
            Ok(Ok(classification)) => {
                debug!(
                    "Classifier result for {}: {:?}",
                    request.request_type, classification
                );
                merge_classification(base, classification)
            }
            Ok(Err(e)) => {
                warn!("Classifier failed, using heuristics: {}", e);
                base
            }
            Err(_) => {
                warn!(
                    "Classifier timed out after {}ms, using heuristics",
                    self.classifier_timeout.as_millis()
                );
                base
            }
        };

        apply_request_hints(requirement, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::openai::mock::{MockOpenAiClient, MockReply};
    use serde_json::json;

    fn analyzer() -> RequirementAnalyzer {
        RequirementAnalyzer::new(Strategy::Hybrid, DEFAULT_REQUEST_TIMEOUT)
    }

    fn llm(replies: Vec<MockReply>) -> Arc<dyn RequirementClassifier> {
        Arc::new(LlmClassifier::new(
            MockOpenAiClient::scripted(replies),
            "classifier".to_string(),
        ))
    }

    #[test]
    fn test_heuristic_type_table() {
        let req = RoutingRequest::new("ai-request", json!({}));
        let r = heuristic_requirement(&req, Strategy::Hybrid, DEFAULT_REQUEST_TIMEOUT);

        assert_eq!(r.capabilities, vec!["ai", "code-completion"]);
        assert_eq!(r.priority, Priority::Medium);
        assert_eq!(r.strategy, Strategy::Hybrid);
        assert_eq!(r.timeout, Duration::from_secs(30));
        assert!(r.retryable);

        let git = RoutingRequest::new("git-operation", json!({}));
        assert_eq!(
            heuristic_requirement(&git, Strategy::Hybrid, DEFAULT_REQUEST_TIMEOUT).capabilities,
            vec!["git"]
        );
    }

    #[test]
    fn test_heuristic_keyword_fallback() {
        let req = RoutingRequest::new("run-sql-report", json!({}));
        let r = heuristic_requirement(&req, Strategy::Load, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(r.capabilities, vec!["database"]);
        assert_eq!(r.strategy, Strategy::Load);

        // "ai" only as a whole word
        let req = RoutingRequest::new("email-digest", json!({}));
        assert!(heuristic_requirement(&req, Strategy::Hybrid, DEFAULT_REQUEST_TIMEOUT)
            .capabilities
            .is_empty());
    }

    #[test]
    fn test_relaxed_requirement() {
        let req = RoutingRequest::new("ai-request", json!({}));
        let relaxed = heuristic_requirement(&req, Strategy::Performance, Duration::from_secs(5)).relaxed();

        assert!(relaxed.capabilities.is_empty());
        assert_eq!(relaxed.strategy, Strategy::Load);
        assert_eq!(relaxed.priority, Priority::Low);
        assert_eq!(relaxed.timeout, Duration::from_secs(5));
        assert!(!relaxed.retryable);
    }

    #[test]
    fn test_parse_classification_embedded_json() {
        let answer = "Sure! Here it is:\n```json\n{\"requiredCapabilities\": [\"git\"], \"priority\": \"high\", \"timeout\": 500}\n```";
        let c = parse_classification(answer).unwrap();

        assert_eq!(c.required_capabilities, vec!["git"]);
        assert_eq!(c.priority.as_deref(), Some("high"));
        assert_eq!(c.timeout, Some(500));
    }

    #[test]
    fn test_parse_classification_rejects_garbage() {
        assert!(matches!(parse_classification("   "), Err(ClassifierError::EmptyResponse)));
        assert!(matches!(
            parse_classification("I cannot decide"),
            Err(ClassifierError::Unparsable(_))
        ));
        assert!(matches!(
            parse_classification("{not json}"),
            Err(ClassifierError::Unparsable(_))
        ));
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("whenever".parse::<Priority>().is_err());
        assert_eq!(Priority::Low.multiplier(), 0.8);
    }

    #[tokio::test]
    async fn test_heuristic_classifier_answers_from_table() {
        let classifier = HeuristicClassifier;

        let known = classifier
            .classify(&RoutingRequest::new("file-operation", json!({})))
            .await
            .unwrap();
        assert_eq!(known.required_capabilities, vec!["filesystem"]);
        assert!(known.strategy.is_none());
        assert!(known.priority.is_none());
        assert!(known.timeout.is_none());

        let keyword = classifier
            .classify(&RoutingRequest::new("nightly-git-gc", json!({})))
            .await
            .unwrap();
        assert_eq!(keyword.required_capabilities, vec!["git"]);

        let unknown = classifier
            .classify(&RoutingRequest::new("ping", json!({})))
            .await
            .unwrap();
        assert!(unknown.required_capabilities.is_empty());
    }

    #[test]
    fn test_parse_classification_repeated_calls() {
        for caps in ["a", "b", "c"] {
            let answer = format!("ok {{\"requiredCapabilities\": [\"{}\"]}} done", caps);
            assert_eq!(parse_classification(&answer).unwrap().required_capabilities, vec![caps]);
        }
    }

    #[tokio::test]
    async fn test_analyze_without_classifier_uses_heuristics() {
        let req = RoutingRequest::new("memory-operation", json!({}));
        let r = analyzer().analyze(&req).await;
        assert_eq!(r.capabilities, vec!["memory"]);
    }

    #[tokio::test]
    async fn test_analyze_uses_classifier_answer() {
        let classifier = llm(vec![MockReply::Text(
            r#"{"requiredCapabilities": ["gpu"], "strategy": "load", "priority": "low", "timeout": 1200}"#.into(),
        )]);
        let analyzer = analyzer().with_classifier(classifier, Duration::from_secs(1));

        let r = analyzer.analyze(&RoutingRequest::new("ai-request", json!({}))).await;
        assert_eq!(r.capabilities, vec!["gpu"]);
        assert_eq!(r.strategy, Strategy::Load);
        assert_eq!(r.priority, Priority::Low);
        assert_eq!(r.timeout, Duration::from_millis(1200));
    }

    #[tokio::test]
    async fn test_analyze_absorbs_classifier_failure() {
        let failing = analyzer().with_classifier(llm(vec![MockReply::Fail]), Duration::from_secs(1));
        let r = failing.analyze(&RoutingRequest::new("git-operation", json!({}))).await;
        assert_eq!(r.capabilities, vec!["git"]);

        let rambling = analyzer()
            .with_classifier(llm(vec![MockReply::Text("no idea".into())]), Duration::from_secs(1));
        let r = rambling.analyze(&RoutingRequest::new("git-operation", json!({}))).await;
        assert_eq!(r.capabilities, vec!["git"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_analyze_classifier_timeout() {
        let analyzer = analyzer().with_classifier(llm(vec![MockReply::Hang]), Duration::from_millis(100));
        let r = analyzer.analyze(&RoutingRequest::new("search-request", json!({}))).await;
        assert_eq!(r.capabilities, vec!["search"]);
    }

    #[tokio::test]
    async fn test_request_hints_override() {
        let classifier = llm(vec![MockReply::Text(r#"{"requiredCapabilities": [], "priority": "low"}"#.into())]);
        let analyzer = analyzer().with_classifier(classifier, Duration::from_secs(1));

        let req = RoutingRequest::new("ai-request", json!({}))
            .with_priority(Priority::High)
            .with_strategy("capability");
        let r = analyzer.analyze(&req).await;

        assert_eq!(r.priority, Priority::High);
        assert_eq!(r.strategy, Strategy::Capability);
    }

    #[tokio::test]
    async fn test_unknown_strategy_hint_resolves_to_hybrid() {
        let req = RoutingRequest::new("ai-request", json!({})).with_strategy("telepathy");
        let analyzer = RequirementAnalyzer::new(Strategy::Performance, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(analyzer.analyze(&req).await.strategy, Strategy::Hybrid);
    }
}
