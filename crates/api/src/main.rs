mod auth;
mod content;
mod ratelimit;
mod routes;
mod state;

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use compressd_core::config::load_config;
use compressd_core::pipeline::PipelineContext;
use compressd_core::startup::connect_broker_or_exit;
use ratelimit::RateLimiter;
use state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "compressd-api")]
#[command(about = "Video compression intake API", long_about = None)]
#[command(version)]
struct Args {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_ansi(true)
        .init();

    info!("compressd-api v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    let broker = connect_broker_or_exit(
        &config.redis_url(),
        Duration::from_secs(config.stall_window_secs),
        config.max_attempts,
    )
    .await;

    let pipeline = Arc::new(PipelineContext::new(&config, broker)?);
    let cors_origins = config.allowed_origins.clone();
    let state = AppState::new(config, pipeline);

    let cors = if cors_origins.is_empty() {
        CorsLayer::new().allow_origin(Any)
    } else {
        let origins: Vec<_> = cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins)
    };

    let limiter = Arc::new(RateLimiter::new());

    let authenticated = Router::new()
        .route("/api/compress", post(routes::compress))
        .route("/api/status", get(routes::status))
        .route("/api/admin/jobs", get(routes::admin_jobs))
        .route("/api/webhook", post(routes::webhook))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    // Rate limiting applies to the /api/ job-management surface only; the
    // static content server under /content is a distinct concern with its
    // own caching headers and isn't subject to the per-IP request budget.
    let api_router = Router::new()
        .route("/api/health", get(routes::health))
        .merge(authenticated)
        .route_layer(axum::middleware::from_fn_with_state(
            limiter.clone(),
            ratelimit::rate_limit,
        ));

    let content_router = Router::new().route("/content/*path", get(content::serve_content));

    let app = Router::new()
        .merge(api_router)
        .merge(content_router)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("listening on {}", args.bind);
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
