//! Request routing pipeline
//!
//! Requirement analysis → candidate filter → suitability scoring → strategy
//! selection → execution, with a single relaxed fallback on failure. The
//! learning engine observes every completed decision.

pub mod error;
pub mod executor;
pub mod filter;
pub mod learning;
pub mod request;
pub mod requirement;
pub mod router;
pub mod scoring;
pub mod strategy;

pub use error::{ErrorKind, RoutingError};
pub use executor::{ExecutionEngine, ExecutorError, HttpExecutor, NetworkExecutor, NodeCall};
pub use filter::{capability_matches, filter_candidates, Candidate};
pub use learning::{
    LearningEngine, NodePatternStats, NodeRecommendation, PatternStats, RoutingDecision, RoutingStatistics,
};
pub use request::{Complexity, HttpMethod, RequestPattern, RoutingRequest};
pub use requirement::{
    heuristic_capabilities, heuristic_requirement, ClassifierError, HeuristicClassifier, LlmClassifier, Priority,
    Requirement, RequirementAnalyzer, RequirementClassifier,
};
pub use router::{
    IntelligentRouter, NodeStatusReport, RegistrationError, RouteFailure, RouteMetadata, RouteResponse,
    RouterBuilder, RouterOptions,
};
pub use scoring::{score_candidates, suitability_score, ScoredCandidate, SuitabilityScore};
pub use strategy::{LlmNodeSelector, NodeSelector, SelectorError, Strategy, StrategySelector};
