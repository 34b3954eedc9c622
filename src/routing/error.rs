use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures of the routing pipeline
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoutingError {
    #[error("No candidate nodes available")]
    NoCandidateNodes,

    /// The chosen node filled up between filtering and dispatch
    #[error("Node '{0}' reached its concurrency limit before dispatch")]
    CapacityExhausted(String),

    #[error("Request to node '{node}' timed out after {timeout_ms}ms")]
    RequestTimeout { node: String, timeout_ms: u64 },

    #[error("Transport error from node '{node}': {message}")]
    Transport { node: String, message: String },

    #[error("Unknown routing strategy '{0}'")]
    UnknownStrategy(String),

    #[error("{primary}; fallback also failed: {fallback}")]
    AllFallbackFailed {
        primary: Box<RoutingError>,
        fallback: Box<RoutingError>,
    },
}

/// Serializable error category reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NoCandidateNodes,
    CapacityExhausted,
    RequestTimeout,
    TransportError,
    UnknownStrategy,
    AllFallbackFailed,
}

impl RoutingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RoutingError::NoCandidateNodes => ErrorKind::NoCandidateNodes,
            RoutingError::CapacityExhausted(_) => ErrorKind::CapacityExhausted,
            RoutingError::RequestTimeout { .. } => ErrorKind::RequestTimeout,
            RoutingError::Transport { .. } => ErrorKind::TransportError,
            RoutingError::UnknownStrategy(_) => ErrorKind::UnknownStrategy,
            RoutingError::AllFallbackFailed { .. } => ErrorKind::AllFallbackFailed,
        }
    }

    /// The error that started the failure chain
    pub fn root_cause(&self) -> &RoutingError {
        match self {
            RoutingError::AllFallbackFailed { primary, .. } => primary.root_cause(),
            other => other,
        }
    }
}
