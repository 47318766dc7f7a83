use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::{Parser, Subcommand};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use ad_domain::config::{Config, ConfigSeverity};
use ad_providers::ProviderRegistry;

mod api;
mod coordinator;
mod hooks;
mod mount_plan;
mod persistence;
mod runtime;
mod scheduler;
mod state;

use state::AppState;

/// Local daemon hosting LLM-driven agent sessions.
#[derive(Parser)]
#[command(name = "agentd")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP/SSE server (default when no subcommand is given).
    Serve,
    /// Validate the configuration file and exit.
    Validate,
    /// Print the resolved configuration as JSON.
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, _path) = load_config()?;
            match run_server(Arc::new(config)).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    tracing::error!(error = %e, "fatal error");
                    std::process::exit(70);
                }
            }
        }
        Some(Command::Validate) => {
            let (config, path) = load_config()?;
            let issues = config.validate();
            for issue in &issues {
                println!("{issue}");
            }
            if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
                eprintln!("{path}: configuration has errors");
                std::process::exit(2);
            }
            println!("{path}: configuration OK");
            Ok(())
        }
        Some(Command::Show) => {
            let (config, _path) = load_config()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Loads `$AGENTD_CONFIG` (default `config.toml`) if it exists, else the
/// built-in defaults.
fn load_config() -> anyhow::Result<(Config, String)> {
    let path = std::env::var("AGENTD_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let config = if std::path::Path::new(&path).exists() {
        let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
        toml::from_str(&raw).with_context(|| format!("parsing {path}"))?
    } else {
        Config::default()
    };
    Ok((config, path))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ad_gateway=debug"));
    let json = std::env::var("AGENTD_CONFIG")
        .ok()
        .and_then(|p| std::fs::read_to_string(p).ok())
        .and_then(|raw| toml::from_str::<Config>(&raw).ok())
        .map(|c| c.observability.json_logs)
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("agentd starting");

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Error => tracing::error!("{issue}"),
            ConfigSeverity::Warning => tracing::warn!("{issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!("configuration has errors, refusing to start");
    }

    let providers = Arc::new(ProviderRegistry::from_config(&config.llm)?);
    for err in providers.init_errors() {
        tracing::warn!(provider_id = %err.provider_id, kind = %err.kind, error = %err.error, "provider failed to initialize");
    }

    let state = Arc::new(AppState::new(config.clone(), providers, config.data.root.clone())?);

    let fire_state = state.clone();
    let fire: scheduler::FireFn = Arc::new(move |request| {
        let fire_state = fire_state.clone();
        Box::pin(async move { fire_state.fire_automation(request).await })
    });
    let scheduler = Arc::new(scheduler::AutomationScheduler::new(state.automations.clone(), fire));
    scheduler.start();
    tracing::info!("automation scheduler started");

    let cors_layer = build_cors_layer(&config.server.cors);

    let max_concurrent = std::env::var("AGENTD_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256);

    let governor_layer = config.server.rate_limit.as_ref().map(|rl| {
        use tower_governor::governor::GovernorConfigBuilder;
        use tower_governor::GovernorLayer;

        let gov_config = GovernorConfigBuilder::default()
            .per_second(rl.requests_per_second.into())
            .burst_size(rl.burst_size)
            .finish()
            .expect("rate_limit: requests_per_second and burst_size must be > 0");

        tracing::info!(requests_per_second = rl.requests_per_second, burst_size = rl.burst_size, "per-IP rate limiting enabled");
        GovernorLayer { config: Arc::new(gov_config) }
    });
    if governor_layer.is_none() {
        tracing::info!("per-IP rate limiting disabled (no [server.rate_limit] in config)");
    }

    let router = api::router(state.clone())
        .layer(cors_layer)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent));
    let app = if let Some(gov) = governor_layer {
        router.layer(gov).with_state(state.clone())
    } else {
        router.with_state(state.clone())
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "agentd listening");

    let shutdown_scheduler = scheduler.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown_scheduler.stop().await;
        })
        .await
        .context("axum server error")?;

    Ok(())
}

/// Builds a [`CorsLayer`] from the configured allowed origins. A literal
/// `"*"` allows every origin (credentials are not used on this API, so
/// that's compatible with a wildcard).
fn build_cors_layer(cors: &ad_domain::config::CorsConfig) -> CorsLayer {
    use axum::http::header;

    if cors.allowed_origins.len() == 1 && cors.allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    let exact: Vec<HeaderValue> = cors
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(hv) => Some(hv),
            Err(_) => {
                tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(exact))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}
