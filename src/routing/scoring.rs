//! Suitability scoring for candidates
//!
//! ```text
//! score = (5 - priority) * 20
//!       + successRate * 0.3 + reliability * 0.2 + efficiency * 0.2
//!       + (1 - load / maxConcurrency) * 30
//!       + max(0, 100 - averageResponseTime / 1000) * 0.1
//! score *= 1.2 (high) | 1.0 (medium) | 0.8 (low)
//! ```
//!
//! The result is clamped to 0..=100. Average response time is in milliseconds.

use serde::Serialize;

use super::filter::Candidate;
use super::requirement::Requirement;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    /// Static node priority term
    pub priority: f64,
    /// Weighted success rate, reliability and efficiency
    pub performance: f64,
    /// Free concurrency slots
    pub headroom: f64,
    /// Lifetime average response time
    pub latency: f64,
    /// Request urgency factor applied to the sum
    pub multiplier: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuitabilityScore {
    pub total: f64,
    pub breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub score: SuitabilityScore,
}

impl ScoredCandidate {
    pub fn id(&self) -> &str {
        &self.candidate.node.id
    }
}

pub fn suitability_score(candidate: &Candidate, requirement: &Requirement) -> SuitabilityScore {
    let node = &candidate.node;
    let metrics = &candidate.metrics;

    let priority = (5.0 - node.priority as f64) * 20.0;
    let performance = metrics.success_rate * 0.3 + metrics.reliability * 0.2 + metrics.efficiency * 0.2;
    let headroom = (1.0 - node.load_ratio()) * 30.0;
    let latency = (100.0 - node.average_response_time_ms() / 1000.0).max(0.0) * 0.1;
    let multiplier = requirement.priority.multiplier();

    let total = ((priority + performance + headroom + latency) * multiplier).clamp(0.0, 100.0);

    SuitabilityScore {
        total,
        breakdown: ScoreBreakdown {
            priority,
            performance,
            headroom,
            latency,
            multiplier,
        },
    }
}

pub fn score_candidates(candidates: Vec<Candidate>, requirement: &Requirement) -> Vec<ScoredCandidate> {
    candidates
        .into_iter()
        .map(|candidate| {
            let score = suitability_score(&candidate, requirement);
            ScoredCandidate { candidate, score }
        })
        .collect()
}
