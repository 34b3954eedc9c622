use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::requirement::Priority;

/// Payloads under this many serialized bytes are low complexity
const LOW_COMPLEXITY_BYTES: usize = 1024;
/// Payloads under this many serialized bytes are medium complexity
const MEDIUM_COMPLEXITY_BYTES: usize = 16 * 1024;

/// HTTP method used when dispatching to a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// Coarse size bucket used to group similar requests for learning
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl Complexity {
    pub fn from_payload(payload: &Value) -> Self {
        let size = match payload {
            Value::Null => 0,
            other => serde_json::to_string(other).map(|s| s.len()).unwrap_or(0),
        };
        if size < LOW_COMPLEXITY_BYTES {
            Complexity::Low
        } else if size < MEDIUM_COMPLEXITY_BYTES {
            Complexity::Medium
        } else {
            Complexity::High
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Complexity::Low => "low",
            Complexity::Medium => "medium",
            Complexity::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Some(Complexity::Low),
            "medium" => Some(Complexity::Medium),
            "high" => Some(Complexity::High),
            _ => None,
        }
    }
}

/// Request type plus complexity bucket; the key learning statistics are kept under
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPattern {
    pub request_type: String,
    pub complexity: Complexity,
}

impl RequestPattern {
    pub fn new(request_type: impl Into<String>, complexity: Complexity) -> Self {
        Self {
            request_type: request_type.into(),
            complexity,
        }
    }
}

impl fmt::Display for RequestPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.request_type, self.complexity.as_str())
    }
}

/// An incoming task to be routed to a node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRequest {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Task type, e.g. "git-operation" or "ai-request"
    #[serde(rename = "type")]
    pub request_type: String,
    /// JSON body forwarded to the node
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub context: HashMap<String, String>,
    #[serde(default)]
    pub method: HttpMethod,
    /// Path on the node the call is sent to
    #[serde(default = "default_path")]
    pub path: String,
    /// Caller-provided priority; overrides classification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// Caller-provided strategy name; overrides classification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
}

fn default_path() -> String {
    "/".to_string()
}

impl RoutingRequest {
    pub fn new(request_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_type: request_type.into(),
            payload,
            context: HashMap::new(),
            method: HttpMethod::default(),
            path: default_path(),
            priority: None,
            strategy: None,
            complexity: None,
        }
    }

    pub fn with_path(mut self, method: HttpMethod, path: impl Into<String>) -> Self {
        self.method = method;
        self.path = path.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn complexity(&self) -> Complexity {
        self.complexity
            .unwrap_or_else(|| Complexity::from_payload(&self.payload))
    }

    pub fn pattern(&self) -> RequestPattern {
        RequestPattern::new(self.request_type.clone(), self.complexity())
    }
}
