//! # noderoute
//!
//! Routes task requests to the best available backend node in a dynamic pool.
//!
//! ```text
//! request ─▶ Requirement Analyzer ─▶ Candidate Filter ─▶ Suitability Scorer
//!                                                             │
//!            Learning Engine ◀── Execution Engine ◀── Strategy Selector
//!                                      │ (on failure)
//!                                      ▼
//!                               Fallback Router
//! ```
//!
//! The [`health`] monitor and the [`metrics`] tracker run beside the request
//! path and feed the state that filtering and scoring read.

pub mod cli;
pub mod client;
pub mod config;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod routing;
pub mod server;

pub use registry::{Node, NodeRegistry, NodeStatus};
pub use routing::{IntelligentRouter, RouteResponse, RoutingError, RoutingRequest, Strategy};
