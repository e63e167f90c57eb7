//! qterm Server - WebSocket bridge between a terminal front end and a shell.
//!
//! This crate provides:
//! - `GET /ws`, the terminal message channel (one session per connection)
//! - `GET /health`, a plain liveness check
//! - The output pump that turns backend bytes into framed output
//! - Keepalive probing and graceful shutdown of open channels

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod config;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod state;
pub mod terminal_streaming;
pub mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use config::ServerConfig;
pub use error::{ChannelError, ChannelResult};
pub use state::AppState;

/// Run the server with the given configuration.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    run_with_shutdown(config, std::future::pending()).await
}

/// Run the server with graceful shutdown support.
pub async fn run_with_shutdown<F>(config: ServerConfig, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {:?}", config.listen_addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    serve(listener, Arc::new(AppState::new(config)), shutdown).await
}

/// Serve on an already bound listener until `shutdown` resolves.
///
/// Open terminal channels are cancelled when shutdown begins and given
/// `shutdown_timeout` to release their backends.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    info!("Starting qterm server on {}", listener.local_addr()?);

    let token = state.shutdown_token().clone();
    let signal = async move {
        shutdown.await;
        token.cancel();
    };

    let app = create_router_with_state(Arc::clone(&state));
    axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await?;

    info!("Server shutting down, closing terminal channels...");
    state
        .shutdown_connections(state.config.shutdown_timeout_duration())
        .await;

    Ok(())
}

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    create_router_with_state(Arc::new(state))
}

/// Create the application router with an Arc-wrapped state.
pub fn create_router_with_state(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(websocket::routes())
        .merge(health::routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use qterm_session::MemoryTrustStore;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_returns_ok() {
        let state = AppState::with_trust_store(ServerConfig::default(), Arc::new(MemoryTrustStore::new()));
        let response = create_router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let state = AppState::with_trust_store(ServerConfig::default(), Arc::new(MemoryTrustStore::new()));
        let response = create_router(state)
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_listen_addr() {
        let config = ServerConfig {
            listen_addr: "not-an-address".to_string(),
            ..ServerConfig::default()
        };
        let err = run(config).await.unwrap_err();
        assert!(err.to_string().contains("invalid listen address"));
    }
}
