use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Default static priority (lower is more preferred)
pub const DEFAULT_PRIORITY: u32 = 3;

/// Default number of concurrent in-flight requests per node
pub const DEFAULT_MAX_CONCURRENCY: u32 = 10;

/// Default per-call timeout for a node
pub const DEFAULT_NODE_TIMEOUT_MS: u64 = 30_000;

/// One entry of the node source: a backend instance the router may dispatch to.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Base URL, e.g. "http://10.0.0.4:9000"
    pub endpoint: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Bearer token sent with every dispatched call. `$VAR` is read from the environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_priority() -> u32 {
    DEFAULT_PRIORITY
}

fn default_max_concurrency() -> u32 {
    DEFAULT_MAX_CONCURRENCY
}

fn default_timeout_ms() -> u64 {
    DEFAULT_NODE_TIMEOUT_MS
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            endpoint: endpoint.into(),
            capabilities: Vec::new(),
            priority: DEFAULT_PRIORITY,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            timeout_ms: DEFAULT_NODE_TIMEOUT_MS,
            tags: Vec::new(),
            api_key: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: u32) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Name for display, falling back to the id
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Check a single node entry for values the router cannot work with.
/// Pure function - no I/O.
pub fn validate_node_spec(spec: &NodeSpec) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidNode {
        id: spec.id.clone(),
        reason: reason.to_string(),
    };

    if spec.id.trim().is_empty() {
        return Err(invalid("id must not be empty"));
    }
    if !(spec.endpoint.starts_with("http://") || spec.endpoint.starts_with("https://")) {
        return Err(invalid("endpoint must be an http:// or https:// URL"));
    }
    if spec.max_concurrency == 0 {
        return Err(invalid("max-concurrency must be at least 1"));
    }
    if spec.timeout_ms == 0 {
        return Err(invalid("timeout-ms must be greater than 0"));
    }
    if spec.capabilities.iter().any(|c| c.trim().is_empty()) {
        return Err(invalid("capabilities must not be empty strings"));
    }

    Ok(())
}
