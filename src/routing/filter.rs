use std::sync::Arc;

use crate::metrics::{PerformanceMetrics, PerformanceTracker};
use crate::registry::Node;

use super::requirement::Requirement;

/// A node that survived filtering, paired with its metrics at filter time
#[derive(Debug, Clone)]
pub struct Candidate {
    pub node: Arc<Node>,
    pub metrics: PerformanceMetrics,
}

/// Case-insensitive substring match in either direction. Blank names never
/// match.
pub fn capability_matches(required: &str, declared: &str) -> bool {
    let required = required.trim().to_lowercase();
    let declared = declared.trim().to_lowercase();
    if required.is_empty() || declared.is_empty() {
        return false;
    }
    declared.contains(&required) || required.contains(&declared)
}

/// Fraction of `required` that `declared` covers; 1.0 when nothing is required
pub fn capability_coverage(declared: &[String], required: &[String]) -> f64 {
    if required.is_empty() {
        return 1.0;
    }
    let matched = required
        .iter()
        .filter(|r| declared.iter().any(|d| capability_matches(r, d)))
        .count();
    matched as f64 / required.len() as f64
}

fn covers_all(declared: &[String], required: &[String]) -> bool {
    required
        .iter()
        .all(|r| declared.iter().any(|d| capability_matches(r, d)))
}

/// Healthy, under capacity, and matching every required capability
pub fn is_candidate(node: &Node, requirement: &Requirement) -> bool {
    node.status().is_healthy()
        && node.has_capacity()
        && covers_all(&node.capabilities, &requirement.capabilities)
}

pub fn filter_candidates(
    nodes: &[Arc<Node>],
    requirement: &Requirement,
    tracker: &PerformanceTracker,
) -> Vec<Candidate> {
    nodes
        .iter()
        .filter(|n| is_candidate(n, requirement))
        .map(|n| Candidate {
            node: Arc::clone(n),
            metrics: tracker.metrics(&n.id),
        })
        .collect()
}
