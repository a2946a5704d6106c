use axum::routing::get;
use axum::Router;

use crate::chat::api;
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Build the full axum Router.
///
/// Must be served with `into_make_service_with_connect_info::<SocketAddr>()`;
/// the WebSocket handler identifies clients by peer address.
pub fn build_router(state: AppState) -> Router {
    // WebSocket endpoint (identity comes from the origin address)
    let ws_routes = Router::new().route("/ws", get(ws_handler::ws_upgrade));

    // Read-only chat API plus the room title
    let api_routes = Router::new()
        .route("/api/messages", get(api::list_messages))
        .route("/api/messages/search", get(api::search_messages))
        .route("/api/users/online", get(api::online_users))
        .route("/api/statistics", get(api::statistics))
        .route("/api/title", get(api::get_title).post(api::set_title));

    // Health check
    let health = Router::new().route("/health", get(health_check));

    Router::new()
        .merge(api_routes)
        .merge(ws_routes)
        .merge(health)
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
