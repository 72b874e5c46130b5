//! Session authentication backend
//!
//! Single-binary service that:
//! 1. Signs users in with Google (authorization code + PKCE)
//! 2. Issues short-lived signed access tokens and rotating refresh tokens
//! 3. Guards application routes with a session layer that refreshes
//!    transparently
//! 4. Sweeps expired sessions in the background

mod auth_routes;
mod config;
mod cookies;
mod cors;
mod error;
mod guards;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use session::{KeySet, SessionStore, StoreBackend, StoreSettings, TokenCodec};
use session_manager::{ManagerSettings, SessionManager, spawn_sweep_task};
use thirdparty::{ExchangeEngine, ExchangeSettings, GoogleProvider, IdentityDirectory};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;
use crate::guards::{Authenticated, RouteGuard};

/// How long in-flight requests get to finish once shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    manager: Arc<SessionManager>,
    config: Arc<AppConfig>,
    guards: Arc<Vec<RouteGuard>>,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// `/me` and `/auth/signout` sit behind the session layer; everything else
/// is public.
fn build_router(state: AppState) -> common::Result<Router> {
    let cors = cors::layer(&state.config.website_domain)?;
    let max_concurrent = state.config.max_concurrent_requests;

    let protected = Router::new()
        .route("/me", get(me_handler))
        .route("/auth/signout", post(auth_routes::sign_out))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            guards::session_layer,
        ));

    Ok(Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/auth/signinup/{provider}", get(auth_routes::sign_in_up))
        .route(
            "/auth/callback/{provider}",
            get(auth_routes::callback_get).post(auth_routes::callback_post),
        )
        .route("/auth/session/refresh", post(auth_routes::refresh))
        .merge(protected)
        .layer(middleware::from_fn(metrics::track_requests))
        .layer(cors)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent))
        .with_state(state))
}

/// Wire codec, stores, provider and exchange engine into a manager.
async fn build_manager(config: &AppConfig) -> Result<SessionManager> {
    let keys = match &config.signing_keys {
        Some(list) => KeySet::parse(list.expose()).context("invalid SESSION_SIGNING_KEYS")?,
        None => {
            warn!("SESSION_SIGNING_KEYS not set, signing with an ephemeral key; access tokens will not survive a restart");
            KeySet::ephemeral()
        }
    };
    info!(kid = keys.current_id(), "signing key ready");

    let tunables = &config.tunables;
    let store = SessionStore::open(
        &config.store_backend,
        StoreSettings {
            session_ttl: tunables.session_ttl(),
            revoked_grace: tunables.revoked_grace(),
        },
    )
    .await
    .context("failed to open session store")?;

    let users_dir = match &config.store_backend {
        StoreBackend::File(dir) => Some(dir.clone()),
        StoreBackend::Memory => None,
    };
    let directory = IdentityDirectory::open(users_dir)
        .await
        .context("failed to open user directory")?;

    let client = reqwest::Client::builder()
        .timeout(tunables.provider_timeout())
        .build()
        .context("failed to build HTTP client")?;
    let google = GoogleProvider::new(
        config.google.client_id.clone(),
        config.google.client_secret.clone(),
    )
    .with_endpoints(tunables.google_endpoints());
    let exchange = ExchangeEngine::new(
        client,
        ExchangeSettings {
            state_ttl: tunables.state_ttl(),
            provider_timeout: tunables.provider_timeout(),
            max_pending: tunables.oauth.max_pending,
            callback_base: config.callback_base(),
        },
    )
    .with_provider(Arc::new(google));

    Ok(SessionManager::new(
        TokenCodec::new(keys),
        store,
        directory,
        exchange,
        ManagerSettings {
            access_token_ttl: tunables.access_token_ttl(),
        },
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is normal in production
    let dotenv = dotenvy::dotenv();

    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    if let Ok(path) = &dotenv {
        info!(path = %path.display(), "loaded environment file");
    }

    // Fail fast: every configuration problem is reported before anything binds
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    info!(
        app_name = %config.app_name,
        listen_addr = %config.listen_addr,
        api_domain = %config.api_domain,
        website_domain = %config.website_domain,
        store = ?config.store_backend,
        "configuration loaded"
    );

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder().context("failed to install Prometheus recorder")?;

    let manager = Arc::new(build_manager(&config).await?);
    let sweep = spawn_sweep_task(manager.clone(), config.tunables.sweep_interval());

    let listen_addr = config.listen_addr;
    let state = AppState {
        manager: manager.clone(),
        config: Arc::new(config),
        guards: Arc::new(guards::default_guards()),
        prometheus,
    };
    let app = build_router(state).context("failed to build router")?;

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires
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
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    sweep.abort();
    if let Err(e) = manager.save().await {
        error!(error = %e, "failed to write final session snapshot");
    }

    info!("shutdown complete");
    Ok(())
}

/// Liveness probe.
async fn health_handler() -> impl IntoResponse {
    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    Json(json!({ "status": "ok", "timestamp": timestamp }))
}

/// The caller's identity, as established by the session layer.
async fn me_handler(Authenticated(context): Authenticated) -> impl IntoResponse {
    Json(json!({
        "userId": context.user_id,
        "sessionHandle": context.session_handle,
    }))
}

/// Prometheus metrics endpoint: returns metrics in text exposition format.
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
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
