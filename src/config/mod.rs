pub mod nodes;

pub use nodes::{validate_node_spec, NodeSpec};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::MIN_WINDOW_SAMPLES;

/// A whole value of the form `$NAME`
static ENV_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\$([A-Za-z_][A-Za-z0-9_]*)$").expect("valid env reference pattern")
});

/// Errors for loading, parsing and validating router configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Duplicate node id: '{0}'")]
    DuplicateNode(String),

    #[error("Invalid node '{id}': {reason}")]
    InvalidNode { id: String, reason: String },

    #[error("Invalid setting '{0}': {1}")]
    InvalidSetting(&'static str, String),

    #[error("Environment variable '{0}' is not set")]
    MissingEnv(String),
}

/// Default config file location: ~/.noderoute/config.yaml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".noderoute")
        .join("config.yaml")
}

/// Expand `~` and `$VAR` in a configured path
pub fn expand_path(path: &str) -> PathBuf {
    match shellexpand::full(path) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(path).as_ref()),
    }
}

/// The complete configuration file structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RouterConfig {
    #[serde(default)]
    pub router: RouterSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
    /// LLM-backed requirement classifier; heuristics are used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifier: Option<ModelEndpoint>,
    /// LLM-backed node selector for the externally-assisted strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<ModelEndpoint>,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RouterSettings {
    /// Strategy used when a request names none (unknown names resolve to hybrid)
    #[serde(default = "default_strategy")]
    pub default_strategy: String,
    /// Maximum routing decisions kept for learning
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_collaborator_timeout_ms")]
    pub classifier_timeout_ms: u64,
    #[serde(default = "default_collaborator_timeout_ms")]
    pub selector_timeout_ms: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            default_strategy: default_strategy(),
            history_limit: default_history_limit(),
            default_timeout_ms: default_request_timeout_ms(),
            classifier_timeout_ms: default_collaborator_timeout_ms(),
            selector_timeout_ms: default_collaborator_timeout_ms(),
        }
    }
}

fn default_strategy() -> String {
    "hybrid".to_string()
}

fn default_history_limit() -> usize {
    1000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_collaborator_timeout_ms() -> u64 {
    3_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct HealthSettings {
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_health_path")]
    pub path: String,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
            path: default_health_path(),
        }
    }
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    5
}

fn default_health_path() -> String {
    "/health".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetricsSettings {
    /// Outcome events kept per node
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Where performance history is loaded from and snapshotted to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persist_path: Option<String>,
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            persist_path: None,
            snapshot_interval_secs: default_snapshot_interval(),
        }
    }
}

fn default_window_size() -> usize {
    100
}

fn default_snapshot_interval() -> u64 {
    300
}

/// An OpenAI-compatible chat endpoint used as an external collaborator
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModelEndpoint {
    pub url: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Supported config file syntaxes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// JSON with optional `//` and `/* */` comments
    Jsonc,
    Yaml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Jsonc,
        }
    }
}

// ============================================================================
// Pure parsing and validation (no I/O)
// ============================================================================

/// Strip C-style comments from JSONC content, leaving string literals intact.
pub fn strip_jsonc_comments(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            result.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                result.push(c);
            }
            ('/', Some('/')) => {
                for nc in chars.by_ref() {
                    if nc == '\n' {
                        result.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for nc in chars.by_ref() {
                    if prev == '*' && nc == '/' {
                        break;
                    }
                    prev = nc;
                }
            }
            _ => result.push(c),
        }
    }

    result
}

/// Parse config text in the given format
pub fn parse_config(content: &str, format: ConfigFormat) -> Result<RouterConfig, ConfigError> {
    match format {
        ConfigFormat::Jsonc => serde_json::from_str(&strip_jsonc_comments(content))
            .map_err(|e| ConfigError::ParseError(e.to_string())),
        ConfigFormat::Yaml => {
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
        }
    }
}

/// Validate node entries and router settings
pub fn validate_config(config: &RouterConfig) -> Result<(), ConfigError> {
    if config.router.history_limit == 0 {
        return Err(ConfigError::InvalidSetting(
            "router.history-limit",
            "must be at least 1".to_string(),
        ));
    }
    if config.metrics.window_size < MIN_WINDOW_SAMPLES {
        return Err(ConfigError::InvalidSetting(
            "metrics.window-size",
            format!("must be at least {}", MIN_WINDOW_SAMPLES),
        ));
    }
    if config.health.interval_secs == 0 {
        return Err(ConfigError::InvalidSetting(
            "health.interval-secs",
            "must be at least 1".to_string(),
        ));
    }
    if config.health.timeout_secs == 0 {
        return Err(ConfigError::InvalidSetting(
            "health.timeout-secs",
            "must be at least 1".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for spec in &config.nodes {
        validate_node_spec(spec)?;
        if !seen.insert(spec.id.as_str()) {
            return Err(ConfigError::DuplicateNode(spec.id.clone()));
        }
    }

    Ok(())
}

/// Resolve a `$NAME` value from the environment; other values pass through.
pub fn resolve_env_reference(value: &str) -> Result<String, ConfigError> {
    let Some(name) = env_reference_name(value) else {
        return Ok(value.to_string());
    };
    std::env::var(&name).map_err(|_| ConfigError::MissingEnv(name))
}

fn env_reference_name(value: &str) -> Option<String> {
    ENV_REFERENCE
        .captures(value.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn resolve_api_key(key: &mut Option<String>) -> Result<(), ConfigError> {
    if let Some(value) = key.as_mut() {
        *value = resolve_env_reference(value)?;
    }
    Ok(())
}

/// Replace every `$NAME` API key in the config with its environment value
pub fn resolve_secrets(config: &mut RouterConfig) -> Result<(), ConfigError> {
    for spec in &mut config.nodes {
        resolve_api_key(&mut spec.api_key)?;
    }
    if let Some(endpoint) = config.classifier.as_mut() {
        resolve_api_key(&mut endpoint.api_key)?;
    }
    if let Some(endpoint) = config.selector.as_mut() {
        resolve_api_key(&mut endpoint.api_key)?;
    }
    Ok(())
}

// ============================================================================
// I/O boundary
// ============================================================================

/// Load, parse, resolve and validate a config file from disk.
pub fn load_config_file(path: &Path) -> Result<RouterConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut config = parse_config(&content, ConfigFormat::from_path(path))?;
    resolve_secrets(&mut config)?;
    validate_config(&config)?;
    Ok(config)
}
