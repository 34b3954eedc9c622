use clap::{ArgAction, Parser};
use std::path::{Path, PathBuf};

use crate::config::{default_config_path, RouterConfig};
use crate::routing::Strategy;

#[derive(Parser, Debug)]
#[command(name = "noderoute")]
#[command(about = "Route requests across a pool of backend nodes by health, load and performance")]
#[command(version)]
pub struct Args {
    /// Path to the router config file (JSON, JSONC or YAML).
    /// Defaults to ~/.noderoute/config.yaml
    pub config_file: Option<PathBuf>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Dry-run mode: validate config and show the node table without serving
    #[arg(long)]
    pub dry_run: bool,

    /// Address the HTTP server binds to
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0")]
    pub bind_addr: String,

    /// Port the HTTP server listens on
    #[arg(short, long, value_name = "PORT", default_value = "8080")]
    pub port: u16,

    /// Path to a .env file for loading API keys
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Allow cross-origin requests from any origin
    #[arg(long)]
    pub cors: bool,
}

impl Args {
    pub fn config_path(&self) -> PathBuf {
        self.config_file.clone().unwrap_or_else(default_config_path)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// ============================================================================
// SBIO: Pure display logic (no I/O - returns formatted strings)
// ============================================================================

/// Format a dry-run output showing settings and the node table.
/// Pure function - returns a formatted string.
pub fn format_dry_run(config: &RouterConfig, config_path: &Path, args: &Args) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "noderoute v{} - Dry Run Mode\n\n",
        env!("CARGO_PKG_VERSION")
    ));
    output.push_str(&format!("Config: {}\n", config_path.display()));
    output.push_str(&format!("Listen: {}\n\n", args.listen_addr()));

    let strategy = config
        .router
        .default_strategy
        .parse::<Strategy>()
        .map(|s| s.to_string())
        .unwrap_or_else(|_| format!("hybrid (unknown '{}')", config.router.default_strategy));

    output.push_str("Router:\n");
    output.push_str(&format!("  default strategy: {}\n", strategy));
    output.push_str(&format!("  history limit:    {}\n", config.router.history_limit));
    output.push_str(&format!("  request timeout:  {}ms\n", config.router.default_timeout_ms));
    output.push_str(&format!(
        "  health sweep:     every {}s, probe {} (timeout {}s)\n",
        config.health.interval_secs, config.health.path, config.health.timeout_secs
    ));
    output.push_str(&format!(
        "  classifier:       {}\n",
        config
            .classifier
            .as_ref()
            .map(|c| format!("{} @ {}", c.model, c.url))
            .unwrap_or_else(|| "heuristic only".to_string())
    ));
    output.push_str(&format!(
        "  node selector:    {}\n",
        config
            .selector
            .as_ref()
            .map(|c| format!("{} @ {}", c.model, c.url))
            .unwrap_or_else(|| "none (external falls back to performance)".to_string())
    ));
    if let Some(ref path) = config.metrics.persist_path {
        output.push_str(&format!(
            "  metrics snapshot: {} every {}s\n",
            path, config.metrics.snapshot_interval_secs
        ));
    }
    output.push('\n');

    output.push_str(&format!("Nodes ({}):\n", config.nodes.len()));
    if config.nodes.is_empty() {
        output.push_str("  (none; register at runtime with POST /nodes)\n");
    }
    for node in &config.nodes {
        output.push_str(&format!(
            "  - {} [{}] -> {}\n",
            node.id,
            node.display_name(),
            node.endpoint
        ));
        output.push_str(&format!(
            "      priority={} max-concurrency={} timeout={}ms\n",
            node.priority, node.max_concurrency, node.timeout_ms
        ));
        if !node.capabilities.is_empty() {
            output.push_str(&format!("      capabilities: {}\n", node.capabilities.join(", ")));
        }
        if !node.tags.is_empty() {
            output.push_str(&format!("      tags: {}\n", node.tags.join(", ")));
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeSpec;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["noderoute"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_defaults() {
        let a = args(&[]);
        assert!(a.config_file.is_none());
        assert_eq!(a.listen_addr(), "0.0.0.0:8080");
        assert!(!a.dry_run);
        assert_eq!(a.verbose, 0);
    }

    #[test]
    fn test_flags() {
        let a = args(&["router.yaml", "-vv", "--port", "9000", "--bind-addr", "127.0.0.1", "--dry-run"]);
        assert_eq!(a.config_path(), PathBuf::from("router.yaml"));
        assert_eq!(a.verbose, 2);
        assert_eq!(a.listen_addr(), "127.0.0.1:9000");
        assert!(a.dry_run);
    }

    #[test]
    fn test_format_dry_run() {
        let mut config = RouterConfig::default();
        config.nodes.push(
            NodeSpec::new("git-1", "http://localhost:9001")
                .with_name("Git worker")
                .with_capabilities(["git"])
                .with_tags(["primary"]),
        );

        let output = format_dry_run(&config, Path::new("router.yaml"), &args(&[]));

        assert!(output.contains("Config: router.yaml"));
        assert!(output.contains("default strategy: hybrid"));
        assert!(output.contains("Nodes (1):"));
        assert!(output.contains("git-1 [Git worker] -> http://localhost:9001"));
        assert!(output.contains("capabilities: git"));
        assert!(output.contains("heuristic only"));
    }

    #[test]
    fn test_format_dry_run_flags_unknown_strategy() {
        let mut config = RouterConfig::default();
        config.router.default_strategy = "psychic".into();

        let output = format_dry_run(&config, Path::new("c.json"), &args(&[]));
        assert!(output.contains("hybrid (unknown 'psychic')"));
        assert!(output.contains("register at runtime"));
    }
}
