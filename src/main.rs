//! Build status backend
//!
//! Serves the commit history of a repository joined with the CI builds that
//! ran against it, cached in memory and refreshed in the background.

mod api;
mod auth;
mod cache;
mod config;
mod db;
mod errors;
mod git;
mod models;

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    routing::{get, post},
    Router,
};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cache::{CacheState, CommitCache, RefreshTask};
use config::Config;
use db::SqliteBuildStore;
use git::GitRepositoryLog;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<CommitCache>,
    pub config: Arc<Config>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting build status backend");
    tracing::info!("Database path: {:?}", config.db_path);
    tracing::info!("Repository path: {:?}", config.repo_path);
    tracing::info!("Snapshot path: {:?}", config.cache_file);
    tracing::info!("Bind address: {}", config.bind_addr);

    if config.api_psk.is_none() {
        tracing::warn!("No API PSK configured (STATUS_API_PSK). Write endpoints are open!");
    }

    let pool = db::init_database(&config.db_path).await?;
    let store = Arc::new(SqliteBuildStore::new(pool));
    let repo = Arc::new(GitRepositoryLog::new(&config.repo_path, config.git_sync));

    let cache = CommitCache::open(
        config.cache_config(),
        store,
        repo,
        config.builder_filter()?,
    )
    .await;

    let state = AppState {
        cache: cache.clone(),
        config: Arc::new(config.clone()),
    };
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    // /health answers LOADING until the first refresh lands.
    let (failed_tx, failed_rx) = watch::channel(false);
    let loader = tokio::spawn(async move {
        tracing::info!("Loading commit cache...");
        match cache.load().await {
            Ok(()) => Ok(RefreshTask::spawn(cache)),
            Err(e) => {
                tracing::error!("Initial cache load failed: {}", e);
                let _ = failed_tx.send(true);
                Err(e)
            }
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(failed_rx.clone()))
        .await?;

    let load_failed = *failed_rx.borrow();
    if !load_failed && !loader.is_finished() {
        tracing::info!("Shutdown before the cache finished loading");
        loader.abort();
        return Ok(());
    }

    tracing::info!("Server stopped; waiting for refresh task");
    let refresher = loader.await??;
    refresher.shutdown().await;

    Ok(())
}

async fn shutdown_signal(mut load_failed: watch::Receiver<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let failed = async move {
        while load_failed.changed().await.is_ok() {
            if *load_failed.borrow_and_update() {
                return;
            }
        }
        // Sender dropped: the cache loaded.
        std::future::pending::<()>().await;
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("Shutdown requested"),
        _ = failed => tracing::info!("Shutting down after failed cache load"),
    }
}

/// Create the application router with all routes.
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Clone PSK for the auth layer
    let psk = state.config.api_psk.clone();

    // Mutating routes
    let write_routes = Router::new()
        .route("/builds/{id}/comments", post(api::add_build_comment))
        .route("/builders/{builder}/status", post(api::set_builder_status))
        .route("/commits/{hash}/comments", post(api::add_commit_comment))
        .route("/refresh", post(api::refresh))
        // Apply PSK auth middleware
        .layer(middleware::from_fn(move |req, next| {
            auth::psk_auth_layer(psk.clone(), req, next)
        }));

    let api_routes = Router::new()
        .route("/builds/{id}", get(api::get_build))
        .merge(write_routes);

    let json_routes = Router::new()
        .route("/commits", get(api::last_commits))
        .route("/commits/range", get(api::commit_range))
        .route("/commits/{idx}", get(api::get_commit));

    // Health check (no auth required)
    let health_routes = Router::new().route("/health", get(health_check));

    Router::new()
        .nest("/api", api_routes)
        .nest("/json", json_routes)
        .merge(health_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint. Healthy once the first refresh has completed.
async fn health_check(State(state): State<AppState>) -> (StatusCode, &'static str) {
    match state.cache.state() {
        CacheState::Ready => (StatusCode::OK, "OK"),
        CacheState::Loading | CacheState::Uninitialized => {
            (StatusCode::SERVICE_UNAVAILABLE, "LOADING")
        }
    }
}

#[cfg(test)]
mod testing;
