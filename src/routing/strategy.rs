//! Node selection strategies
//!
//! Every strategy picks one of the scored candidates. Ties on a strategy's
//! own key are broken by higher suitability score, then by lowest node id,
//! so identical inputs always yield the same node.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::error::RoutingError;
use super::filter::capability_coverage;
use super::requirement::Requirement;
use super::scoring::ScoredCandidate;
use crate::client::{ChatCompletionRequest, ClientError, OpenAiClientTrait};

/// Keys closer than this are treated as equal
const KEY_EPSILON: f64 = 1e-9;

const PERFORMANCE_VOTE: f64 = 0.4;
const CAPABILITY_VOTE: f64 = 0.3;
const LOAD_VOTE: f64 = 0.3;
const SUITABILITY_TIE_WEIGHT: f64 = 0.001;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Performance,
    Capability,
    Load,
    /// Delegates the pick to a [`NodeSelector`]
    External,
    #[default]
    Hybrid,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Performance => "performance",
            Strategy::Capability => "capability",
            Strategy::Load => "load",
            Strategy::External => "external",
            Strategy::Hybrid => "hybrid",
        }
    }

    /// Parse a strategy name, defaulting to Hybrid for unknown names
    pub fn resolve(name: &str) -> Self {
        match name.parse() {
            Ok(strategy) => strategy,
            Err(e) => {
                warn!("{}, using hybrid", e);
                Strategy::Hybrid
            }
        }
    }
}

impl FromStr for Strategy {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "performance" => Ok(Strategy::Performance),
            "capability" => Ok(Strategy::Capability),
            "load" => Ok(Strategy::Load),
            "external" | "ai-assisted" | "externally-assisted" => Ok(Strategy::External),
            "hybrid" => Ok(Strategy::Hybrid),
            _ => Err(RoutingError::UnknownStrategy(s.to_string())),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SBIO: Pure strategies over scored candidates
// ============================================================================

/// Index of the candidate with the highest `key`, with the shared tie-break
fn pick_max<F>(candidates: &[ScoredCandidate], key: F) -> Option<usize>
where
    F: Fn(usize, &ScoredCandidate) -> f64,
{
    let mut best: Option<(usize, f64)> = None;

    for (idx, candidate) in candidates.iter().enumerate() {
        let k = key(idx, candidate);
        let replace = match best {
            None => true,
            Some((best_idx, best_key)) => {
                let incumbent = &candidates[best_idx];
                if (k - best_key).abs() > KEY_EPSILON {
                    k > best_key
                } else if (candidate.score.total - incumbent.score.total).abs() > KEY_EPSILON {
                    candidate.score.total > incumbent.score.total
                } else {
                    candidate.id() < incumbent.id()
                }
            }
        };
        if replace {
            best = Some((idx, k));
        }
    }

    best.map(|(idx, _)| idx)
}

pub fn performance_weight(candidate: &ScoredCandidate) -> f64 {
    let m = &candidate.candidate.metrics;
    0.4 * m.success_rate + 0.3 * m.reliability + 0.3 * m.efficiency
}

pub fn select_by_performance(candidates: &[ScoredCandidate]) -> Option<usize> {
    pick_max(candidates, |_, c| performance_weight(c))
}

pub fn select_by_capability(candidates: &[ScoredCandidate], requirement: &Requirement) -> Option<usize> {
    pick_max(candidates, |_, c| {
        capability_coverage(&c.candidate.node.capabilities, &requirement.capabilities)
    })
}

pub fn select_by_load(candidates: &[ScoredCandidate]) -> Option<usize> {
    pick_max(candidates, |_, c| -c.candidate.node.load_ratio())
}

/// Weighted vote of the three pure strategies plus a small suitability term
pub fn select_hybrid(candidates: &[ScoredCandidate], requirement: &Requirement) -> Option<usize> {
    let mut votes: HashMap<usize, f64> = HashMap::new();

    let ballots = [
        (select_by_performance(candidates), PERFORMANCE_VOTE),
        (select_by_capability(candidates, requirement), CAPABILITY_VOTE),
        (select_by_load(candidates), LOAD_VOTE),
    ];
    for (choice, weight) in ballots {
        if let Some(idx) = choice {
            *votes.entry(idx).or_default() += weight;
        }
    }

    pick_max(candidates, |idx, c| {
        let vote = votes.get(&idx).copied().unwrap_or(0.0);
        vote + SUITABILITY_TIE_WEIGHT * c.score.total
    })
}

// ============================================================================
// External selector seam
// ============================================================================

/// What an external selector gets to see about each candidate
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSummary {
    pub index: usize,
    pub id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub current_load: u32,
    pub max_concurrency: u32,
    pub success_rate: f64,
    pub suitability: f64,
}

impl CandidateSummary {
    pub fn from_scored(index: usize, scored: &ScoredCandidate) -> Self {
        let node = &scored.candidate.node;
        Self {
            index,
            id: node.id.clone(),
            name: node.name.clone(),
            capabilities: node.capabilities.clone(),
            current_load: node.current_load(),
            max_concurrency: node.max_concurrency,
            success_rate: scored.candidate.metrics.success_rate,
            suitability: scored.score.total,
        }
    }
}

#[derive(Error, Debug)]
pub enum SelectorError {
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Empty response from selector")]
    EmptyResponse,

    #[error("No valid node selected from response: '{0}'")]
    InvalidSelection(String),
}

#[async_trait]
pub trait NodeSelector: Send + Sync {
    /// Return the index of the chosen candidate
    async fn select(
        &self,
        candidates: &[CandidateSummary],
        requirement: &Requirement,
    ) -> Result<usize, SelectorError>;
}

pub fn build_selection_prompt(candidates: &[CandidateSummary], requirement: &Requirement) -> String {
    let listing = candidates
        .iter()
        .map(|c| {
            format!(
                "{}. {} ({}) capabilities=[{}] load={}/{} success={:.0}% score={:.1}",
                c.index,
                c.id,
                c.name,
                c.capabilities.join(", "),
                c.current_load,
                c.max_concurrency,
                c.success_rate,
                c.suitability
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Required capabilities: [{}]\nPriority: {}\n\n\
         Choose the best node for this request from the list below, \
         outputting ONLY its number or id:\n{}",
        requirement.capabilities.join(", "),
        requirement.priority,
        listing
    )
}

/// Map a selector answer onto a candidate index.
///
/// Tries, in order: exact id or name, a bare 0-based index, case-insensitive
/// id or name, then the longest id or name contained in the answer.
pub fn parse_selection(response: &str, candidates: &[CandidateSummary]) -> Result<usize, SelectorError> {
    let response = response.trim();
    if response.is_empty() {
        return Err(SelectorError::EmptyResponse);
    }

    if let Some(pos) = candidates
        .iter()
        .position(|c| response == c.id || response == c.name)
    {
        return Ok(pos);
    }

    let numeric = response.trim_end_matches(['.', ')']);
    if let Ok(index) = numeric.parse::<usize>() {
        if index < candidates.len() {
            return Ok(index);
        }
        return Err(SelectorError::InvalidSelection(response.to_string()));
    }

    let lower = response.to_lowercase();
    if let Some(pos) = candidates
        .iter()
        .position(|c| lower == c.id.to_lowercase() || lower == c.name.to_lowercase())
    {
        return Ok(pos);
    }

    candidates
        .iter()
        .enumerate()
        .flat_map(|(pos, c)| [(pos, c.id.to_lowercase()), (pos, c.name.to_lowercase())])
        .filter(|(_, label)| !label.is_empty() && lower.contains(label.as_str()))
        .max_by(|a, b| a.1.len().cmp(&b.1.len()).then(b.0.cmp(&a.0)))
        .map(|(pos, _)| pos)
        .ok_or_else(|| SelectorError::InvalidSelection(response.to_string()))
}

const SELECTOR_SYSTEM_PROMPT: &str = "You pick backend nodes for a request router.";

/// Node selector backed by a chat-completion model
pub struct LlmNodeSelector<C: OpenAiClientTrait> {
    client: C,
    model: String,
}

impl<C: OpenAiClientTrait> LlmNodeSelector<C> {
    pub fn new(client: C, model: String) -> Self {
        Self { client, model }
    }
}

#[async_trait]
impl<C: OpenAiClientTrait> NodeSelector for LlmNodeSelector<C> {
    async fn select(
        &self,
        candidates: &[CandidateSummary],
        requirement: &Requirement,
    ) -> Result<usize, SelectorError> {
        let chat = ChatCompletionRequest::for_decision(
            self.model.clone(),
            SELECTOR_SYSTEM_PROMPT,
            build_selection_prompt(candidates, requirement),
            50,
        );
        let response = self.client.chat_completion(&chat).await?;
        parse_selection(response.first_content().unwrap_or_default(), candidates)
    }
}

// ============================================================================
// Selector
// ============================================================================

/// Which candidate was picked, and by which strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub index: usize,
    /// Differs from the requested strategy when External fell back
    pub strategy: Strategy,
}

#[derive(Clone)]
pub struct StrategySelector {
    node_selector: Option<Arc<dyn NodeSelector>>,
    selector_timeout: Duration,
}

impl Default for StrategySelector {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategySelector {
    pub fn new() -> Self {
        Self {
            node_selector: None,
            selector_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_node_selector(mut self, selector: Arc<dyn NodeSelector>, deadline: Duration) -> Self {
        self.node_selector = Some(selector);
        self.selector_timeout = deadline;
        self
    }

    pub async fn select(
        &self,
        strategy: Strategy,
        candidates: &[ScoredCandidate],
        requirement: &Requirement,
    ) -> Option<Selection> {
        let index = match strategy {
            Strategy::Performance => select_by_performance(candidates),
            Strategy::Capability => select_by_capability(candidates, requirement),
            Strategy::Load => select_by_load(candidates),
            Strategy::Hybrid => select_hybrid(candidates, requirement),
            Strategy::External => {
                if let Some(index) = self.select_external(candidates, requirement).await {
                    return Some(Selection { index, strategy });
                }
                return select_by_performance(candidates).map(|index| Selection {
                    index,
                    strategy: Strategy::Performance,
                });
            }
        };
        index.map(|index| Selection { index, strategy })
    }

    async fn select_external(&self, candidates: &[ScoredCandidate], requirement: &Requirement) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let Some(ref selector) = self.node_selector else {
            debug!("No external node selector configured, using performance");
            return None;
        };

        let summaries: Vec<CandidateSummary> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| CandidateSummary::from_scored(i, c))
            .collect();

        match timeout(self.selector_timeout, selector.select(&summaries, requirement)).await {
            Ok(Ok(index)) if index < candidates.len() => Some(index),
            Ok(Ok(index)) => {
                warn!("Node selector returned out-of-range index {}", index);
                None
            }
            Ok(Err(e)) => {
                warn!("Node selector failed, using performance: {}", e);
                None
            }
            Err(_) => {
                warn!(
                    "Node selector timed out after {}ms, using performance",
                    self.selector_timeout.as_millis()
                );
                None
            }
        }
    }
}
