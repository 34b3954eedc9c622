use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use noderoute::cli::{format_dry_run, Args};
use noderoute::client::OpenAiClient;
use noderoute::config::{expand_path, load_config_file, RouterConfig};
use noderoute::health::spawn_health_monitor;
use noderoute::metrics::{load_snapshot, spawn_snapshotter, PerformanceTracker};
use noderoute::routing::{IntelligentRouter, LlmClassifier, LlmNodeSelector, RouterOptions};
use noderoute::server::{create_router, AppState};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    // Load .env before the config so `$NAME` api keys resolve
    if let Some(ref env_file) = args.env_file {
        dotenvy::from_path(env_file)
            .with_context(|| format!("Failed to load env file {}", env_file.display()))?;
    }

    let config_path = args.config_path();
    let config = load_config_file(&config_path)
        .with_context(|| format!("Failed to load config file {}", config_path.display()))?;

    if args.dry_run {
        println!("{}", format_dry_run(&config, &config_path, &args));
        return Ok(());
    }

    let options = RouterOptions::from(&config);
    let tracker = Arc::new(PerformanceTracker::new(options.window_size));

    let persist_path = config.metrics.persist_path.as_deref().map(expand_path);
    if let Some(ref path) = persist_path {
        match load_snapshot(&tracker, path) {
            Ok(events) => info!("Restored {} outcome events from {}", events, path.display()),
            Err(e) => warn!("Ignoring metrics snapshot {}: {}", path.display(), e),
        }
    }

    let router = Arc::new(build_router(&config, options, Arc::clone(&tracker))?);

    let sweep = router
        .register_nodes(&config.nodes)
        .await
        .context("Failed to register configured nodes")?;
    info!(
        "Loaded {} nodes ({} healthy)",
        config.nodes.len(),
        sweep.healthy
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = vec![spawn_health_monitor(router.health_monitor(), shutdown_rx.clone())];
    if let Some(path) = persist_path {
        let interval = Duration::from_secs(config.metrics.snapshot_interval_secs);
        background.push(spawn_snapshotter(tracker, path, interval, shutdown_rx));
    }

    let mut app = create_router(AppState::new(Arc::clone(&router)));
    if args.cors {
        info!("CORS enabled for all origins");
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    let addr = args.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Server listening on {}", addr);
    info!("Endpoints:");
    info!("  GET    /health                         - Router health");
    info!("  GET    /nodes                          - Node status and metrics");
    info!("  POST   /nodes                          - Register a node");
    info!("  DELETE /nodes/{{id}}                     - Remove a node");
    info!("  GET    /stats                          - Routing statistics");
    info!("  POST   /route                          - Route a request");
    info!("  GET    /patterns/{{type}}/{{complexity}}   - Best node for a pattern");
    info!("  GET    /decisions?limit=N              - Recent routing decisions");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested");
        })
        .await
        .context("Server error")?;

    let _ = shutdown_tx.send(true);
    for handle in background {
        if let Err(e) = handle.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    Ok(())
}

/// Wire the optional LLM collaborators from config into the router
fn build_router(
    config: &RouterConfig,
    options: RouterOptions,
    tracker: Arc<PerformanceTracker>,
) -> anyhow::Result<IntelligentRouter> {
    let classifier_timeout = options.classifier_timeout;
    let selector_timeout = options.selector_timeout;
    let mut builder = IntelligentRouter::builder(options).tracker(tracker);

    if let Some(ref endpoint) = config.classifier {
        let client = OpenAiClient::from_endpoint(endpoint, classifier_timeout)
            .context("Failed to create classifier client")?;
        info!("Using classifier model {} at {}", endpoint.model, endpoint.url);
        builder = builder.classifier(Arc::new(LlmClassifier::new(client, endpoint.model.clone())));
    }

    if let Some(ref endpoint) = config.selector {
        let client = OpenAiClient::from_endpoint(endpoint, selector_timeout)
            .context("Failed to create selector client")?;
        info!("Using node selector model {} at {}", endpoint.model, endpoint.url);
        builder = builder.node_selector(Arc::new(LlmNodeSelector::new(client, endpoint.model.clone())));
    }

    Ok(builder.build())
}
