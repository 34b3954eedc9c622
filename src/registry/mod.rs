//! Node Registry - the set of known backend nodes
//!
//! The registry owns every [`Node`]. Callers get `Arc<Node>` handles and go
//! through the node's own synchronized accessors; the underlying map is never
//! exposed. Nodes stay registered when they turn unhealthy and are removed
//! only by an explicit [`NodeRegistry::remove`].

pub mod node;

pub use node::{LoadGuard, Node, NodeStatus, RequestCounters};

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use crate::config::NodeSpec;

#[derive(Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error("Node '{0}' already registered")]
    NodeExists(String),

    #[error("Node '{0}' not found")]
    NodeNotFound(String),
}

#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<DashMap<String, Arc<Node>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node; ids must be unique
    pub fn register(&self, node: Node) -> Result<Arc<Node>, RegistryError> {
        match self.nodes.entry(node.id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::NodeExists(node.id)),
            Entry::Vacant(slot) => {
                let node = Arc::new(node);
                slot.insert(Arc::clone(&node));
                Ok(node)
            }
        }
    }

    pub fn register_spec(&self, spec: &NodeSpec) -> Result<Arc<Node>, RegistryError> {
        self.register(Node::from_spec(spec))
    }

    pub fn get(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes.get(id).map(|r| Arc::clone(r.value()))
    }

    /// Snapshot of all nodes, ordered by id
    pub fn all(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<Arc<Node>> = self.nodes.iter().map(|r| Arc::clone(r.value())).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Administrative removal. The returned node is marked retired so that
    /// calls still in flight on it stop feeding shared state.
    pub fn remove(&self, id: &str) -> Result<Arc<Node>, RegistryError> {
        self.nodes
            .remove(id)
            .map(|(_, n)| {
                n.retire();
                n
            })
            .ok_or_else(|| RegistryError::NodeNotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
