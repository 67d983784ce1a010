//! HTTP control surface: connection management, direct invocation, the chat
//! event stream and out-of-band tool results.

pub mod routes;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::mcp::{ConnectionRegistry, ToolInvoker};
use crate::relay::StreamRelay;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub invoker: ToolInvoker,
    pub relay: Arc<StreamRelay>,
}

impl AppState {
    pub fn new(registry: Arc<ConnectionRegistry>, relay: Arc<StreamRelay>) -> Self {
        Self {
            invoker: ToolInvoker::new(registry.clone()),
            registry,
            relay,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/mcp/connect", post(routes::connect))
        .route("/api/mcp/disconnect", post(routes::disconnect))
        .route(
            "/api/mcp/status",
            get(routes::status_list).post(routes::status_one),
        )
        .route("/api/mcp/tool", post(routes::call_tool))
        .route("/api/mcp/prompt", post(routes::get_prompt))
        .route("/api/mcp/resource", post(routes::read_resource))
        .route("/api/chat/stream", get(routes::chat_stream))
        .route("/api/chat/execute-function", post(routes::execute_function))
        .route("/api/chat/results/:call_id", get(routes::tool_result))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Serves until the listener fails.
pub async fn serve(bind: &str, state: AppState) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(address = %listener.local_addr()?, "HTTP control surface listening");
    axum::serve(listener, router(state)).await
}
