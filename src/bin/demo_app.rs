//! Demo web app - the sample service the deploy pipeline ships
//!
//! Serves a greeting, a health probe, and an info endpoint so a deploy
//! can be verified end to end. Configured entirely through environment
//! variables: `PORT`, `APP_VERSION`, `APP_ENV`.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Immutable facts about this instance, shared with every handler.
#[derive(Debug)]
struct AppState {
    version: String,
    environment: String,
    hostname: String,
    started: Instant,
}

/// Body served at `/`.
#[derive(Debug, Serialize)]
struct GreetingResponse {
    message: String,
    timestamp: DateTime<Utc>,
    version: String,
    env: String,
    hostname: String,
}

/// Body served at `/health`.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    timestamp: DateTime<Utc>,
    uptime: String,
}

/// Body served at `/api/info`.
#[derive(Debug, Serialize)]
struct InfoResponse {
    app_name: String,
    version: String,
    environment: String,
    hostname: String,
    timestamp: DateTime<Utc>,
    endpoints: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let state = Arc::new(AppState {
        version: std::env::var("APP_VERSION").unwrap_or_else(|_| "v1.0.0".to_string()),
        environment: std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        // Inside a pod this is the pod name.
        hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
        started: Instant::now(),
    });

    let app = Router::new()
        .route("/", get(greeting))
        .route("/health", get(health))
        .route("/api/info", get(info))
        .with_state(state.clone());

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!(
        %port,
        version = %state.version,
        environment = %state.environment,
        hostname = %state.hostname,
        "demo web app listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("demo web app shutting down");
    Ok(())
}

/// Main endpoint
async fn greeting(State(state): State<Arc<AppState>>) -> Json<GreetingResponse> {
    Json(GreetingResponse {
        message: "Hello from Demo Web App! 🚀".to_string(),
        timestamp: Utc::now(),
        version: state.version.clone(),
        env: state.environment.clone(),
        hostname: state.hostname.clone(),
    })
}

/// Health check endpoint
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
        uptime: format!("{:?}", state.started.elapsed()),
    })
}

/// App information endpoint
async fn info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    Json(InfoResponse {
        app_name: "demo-web-app".to_string(),
        version: state.version.clone(),
        environment: state.environment.clone(),
        hostname: state.hostname.clone(),
        timestamp: Utc::now(),
        endpoints: vec![
            "/".to_string(),
            "/health".to_string(),
            "/api/info".to_string(),
        ],
    })
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
