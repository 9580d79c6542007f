//! The broker's HTTP surface: exactly two websocket endpoints, `/ws` for
//! dashboard clients and `/gw` for gateways. Everything else the teacher
//! router carried (web client assets, OAuth2 login) has no counterpart here.

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::auth::Keys;
use crate::broker::Hub;

pub mod ws_client;
pub mod ws_gateway;

/// Shared state handed to every websocket handler.
pub struct AppState {
    pub hub: Arc<Hub>,
    pub keys: Keys,
}

pub type SharedState = Arc<AppState>;

/// Builds the broker's router.
pub fn make_app_router(hub: Arc<Hub>, keys: Keys) -> Router {
    let state: SharedState = Arc::new(AppState { hub, keys });

    Router::new()
        .route("/ws", get(ws_client::ws_handler))
        .route("/gw", get(ws_gateway::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
