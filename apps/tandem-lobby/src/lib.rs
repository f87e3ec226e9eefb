pub mod auth;
pub mod cli;
pub mod config;
pub mod matchmaker;
pub mod registry;
pub mod websocket;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use websocket::{websocket_handler, Lobby};

async fn health_check() -> &'static str {
    "ok"
}

/// Build the lobby router: a health probe plus the signaling channel.
pub fn router(lobby: Lobby) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .with_state(lobby)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
