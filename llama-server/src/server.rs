//! Router construction and the listening loop.

use crate::handlers;
use crate::state::AppState;
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use llama_common::{CommonError, ValidatedConfig};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] CommonError),

    #[error("Cannot listen on {addr}: {source}\n💡 Is another server already using this port? Try --port")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// Browser preflight: origin mirrored with credentials, POST allowed, any header
fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true)
        .allow_methods([Method::POST])
        .allow_headers(AllowHeaders::mirror_request())
}

/// All routes over `state`
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::health))
        .route("/health", get(handlers::health))
        .route("/models", get(handlers::models))
        .route("/v1/models", get(handlers::models))
        .route("/models/:model", get(handlers::model_detail))
        .route("/v1/models/:model", get(handlers::model_detail))
        .route("/api/tags", get(handlers::api_tags))
        .route("/api/show", post(handlers::api_show))
        .route("/api/chat", post(handlers::chat_completions))
        .route("/chat/completions", post(handlers::chat_completions))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/completions", post(handlers::completions))
        .route("/v1/completions", post(handlers::completions))
        .route("/v1/responses", post(handlers::responses))
        .route("/fim", post(handlers::infill))
        .route("/infill", post(handlers::infill))
        .route("/embeddings", post(handlers::embeddings))
        .route("/v1/embeddings", post(handlers::embeddings))
        .route("/model/oai_to_text", post(handlers::oai_to_text))
        .route("/props", get(handlers::props))
        .layer(cors())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind to the configured address; port 0 picks a free port
pub async fn bind(state: &AppState) -> Result<TcpListener, ServerError> {
    state.config.validate()?;
    let addr = state.config.socket_addr()?;
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

/// Serve until `shutdown` resolves, then drain queued requests
pub async fn serve(
    state: Arc<AppState>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let local = listener.local_addr().map_err(ServerError::Serve)?;
    info!("Server can be accessed at http://{}", local);

    let result = axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown)
        .await;
    if let Err(e) = &result {
        error!("HTTP server error: {}", e);
    }

    info!("HTTP server stopped, draining requests");
    state.shutdown().await;
    result.map_err(ServerError::Serve)
}

/// Serve until Ctrl-C
pub async fn run(state: Arc<AppState>) -> Result<(), ServerError> {
    let listener = bind(&state).await?;
    serve(state, listener, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Ctrl-C received, shutting down");
    })
    .await
}
