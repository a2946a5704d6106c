use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;

use crate::state::AppState;
use crate::store::run_blocking;
use crate::ws::session;

/// GET /ws
/// WebSocket upgrade endpoint. The client is identified by its origin
/// address; the user record is resolved (or created) before upgrading, so
/// a storage failure is reported as a plain HTTP 500.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = client_origin(&headers, peer, state.trust_forwarded_for);

    let lookup_origin = origin.clone();
    let lookup = match run_blocking(&state.store, move |s| {
        s.find_or_create_user_by_origin(&lookup_origin)
    })
    .await
    {
        Ok(lookup) => lookup,
        Err(e) => {
            tracing::error!(origin = %origin, error = %e, "Failed to resolve user for connection");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to resolve user").into_response();
        }
    };

    tracing::debug!(
        origin = %origin,
        user_id = lookup.user.id,
        created = lookup.created,
        "Upgrading WebSocket connection"
    );

    ws.on_upgrade(move |socket| session::run_session(socket, state, lookup))
}

/// Address that identifies a client. Behind a trusted proxy this is the first
/// X-Forwarded-For entry; otherwise the TCP peer.
pub fn client_origin(headers: &HeaderMap, peer: SocketAddr, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(addr) = forwarded {
            return addr.to_string();
        }
    }
    peer.ip().to_string()
}
