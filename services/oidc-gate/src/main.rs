//! OIDC Gate
//!
//! Single-binary Rust service that:
//! 1. Sends unauthenticated browsers through the provider's Authorization
//!    Code flow
//! 2. Completes the flow on the callback (state check, code exchange,
//!    identity token verification, refresh token storage)
//! 3. Serves protected routes to authenticated sessions, renewing access
//!    tokens and forcing re-consent when a grant has been revoked

mod callback;
mod config;
mod error;
mod gate;
mod metrics;
mod protected;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use oidc_flow::{
    AuthorizationRequestBuilder, FileRefreshTokenStore, FlowComponents, FlowEngine, FlowPolicy,
    InMemoryRefreshTokenStore, InMemorySessionStore, JwksVerifier, RefreshTokenStore,
    SessionStore, TokenExchanger, spawn_session_sweeper,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::gate::CookieSettings;
use crate::metrics::{ServiceMetrics, TimedExchange};

/// How long in-flight requests get to finish after a shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How often idle sessions are dropped from the in-memory store
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    engine: Arc<FlowEngine>,
    sessions: Arc<dyn SessionStore>,
    http: reqwest::Client,
    userinfo_endpoint: String,
    cookie: CookieSettings,
    force_https: bool,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

/// Wire the flow engine and its collaborators from configuration.
async fn build_state(config: &Config, prometheus: PrometheusHandle) -> Result<AppState> {
    let http = reqwest::Client::new();
    let client_secret = config
        .oauth
        .client_secret
        .clone()
        .context("client secret was not resolved")?;

    let refresh_store: Arc<dyn RefreshTokenStore> = match &config.storage.refresh_token_file {
        Some(path) => Arc::new(
            FileRefreshTokenStore::open(path.clone())
                .await
                .with_context(|| format!("failed to open refresh token file {}", path.display()))?,
        ),
        None => {
            warn!("no storage.refresh_token_file configured, refresh tokens are kept in memory");
            Arc::new(InMemoryRefreshTokenStore::new())
        }
    };

    let authorizer = AuthorizationRequestBuilder::new(
        &config.provider.authorization_endpoint,
        &config.oauth.client_id,
    )
    .context("invalid provider.authorization_endpoint")?;

    let exchanger = TimedExchange::new(TokenExchanger::new(
        http.clone(),
        &config.provider.token_endpoint,
        &config.oauth.client_id,
        client_secret,
    ));
    let verifier = JwksVerifier::new(
        http.clone(),
        &config.provider.jwks_uri,
        &config.oauth.client_id,
        config.provider.issuers.clone(),
    );

    let engine = FlowEngine::new(
        FlowComponents {
            authorizer,
            redirect_uri: Arc::new(config.oauth.redirect_uri.clone()),
            scopes: Arc::new(config.oauth.scopes.clone()),
            exchanger: Arc::new(exchanger),
            verifier: Arc::new(verifier),
            refresh_store,
        },
        FlowPolicy {
            reauthenticate_every_request: config.oauth.reauthenticate_every_request,
            auto_handle_revocation: config.oauth.auto_handle_revocation,
            use_pkce: config.oauth.use_pkce,
            offline_access: true,
            default_redirect: config.oauth.default_redirect.clone(),
        },
    );

    let sessions = Arc::new(InMemorySessionStore::with_idle_timeout(Duration::from_secs(
        config.server.session_idle_timeout_secs,
    )));
    spawn_session_sweeper(sessions.clone(), SESSION_SWEEP_INTERVAL);

    Ok(AppState {
        engine: Arc::new(engine),
        sessions,
        http,
        userinfo_endpoint: config.provider.userinfo_endpoint.clone(),
        cookie: CookieSettings {
            name: config.server.session_cookie.clone(),
            secure: config.oauth.force_https,
        },
        force_https: config.oauth.force_https,
        metrics: ServiceMetrics::new(),
        prometheus,
    })
}

/// Build the axum router with all routes and shared state.
///
/// Only `/` and `/me` sit behind the gate. The callback, logout, health and
/// metrics routes must stay reachable without a completed flow.
fn build_router(state: AppState, max_connections: usize, callback_path: &str) -> Router {
    let protected = Router::new()
        .route("/", get(protected::index_handler))
        .route("/me", get(protected::me_handler))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            gate::require_auth,
        ));

    Router::new()
        .route(
            callback_path,
            get(callback::callback_handler).fallback(callback::callback_not_supported),
        )
        .route("/logout", get(callback::logout_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(protected)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting oidc-gate");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        client_id = %config.oauth.client_id,
        redirect_uri = %config.oauth.redirect_uri,
        scopes = config.oauth.scopes.len(),
        use_pkce = config.oauth.use_pkce,
        reauthenticate_every_request = config.oauth.reauthenticate_every_request,
        "configuration loaded"
    );

    let state = build_state(&config, prometheus_handle).await?;
    let app = build_router(state, config.server.max_connections, &config.callback_path());

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires: notify the
    // server to drain, then race the drain against the timeout.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: status, uptime and counters as JSON.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "healthy",
        "uptime_seconds": state.metrics.started_at.elapsed().as_secs(),
        "requests_served": state.metrics.requests(),
        "flows_completed": state.metrics.completed(),
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
