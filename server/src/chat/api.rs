//! REST endpoints for history, search, presence, statistics and the room title.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::db::models::{StoredMessage, User};
use crate::state::AppState;
use crate::store::run_blocking;
use crate::ws::protocol::OutboundMessage;

/// Default page size for message history.
const DEFAULT_LIMIT: usize = 50;
/// Maximum page size for message history.
const MAX_LIMIT: usize = 200;
/// Maximum number of search results.
const MAX_SEARCH_RESULTS: usize = 100;

// --- Request / Response types ---

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

#[derive(Debug, Serialize)]
pub struct StatisticsResponse {
    pub user_count: i64,
    pub message_count: i64,
    pub active_user_count: usize,
    pub online_users: Vec<User>,
    pub recent_messages: Vec<StoredMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TitleBody {
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Serialize)]
pub struct TitleUpdated {
    pub success: bool,
    pub title: String,
}

// --- Handlers ---

/// GET /api/messages?limit=N
/// Most recent messages, oldest first.
pub async fn list_messages(
    State(state): State<AppState>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<Vec<StoredMessage>>, StatusCode> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    run_blocking(&state.store, move |s| s.recent_messages(limit))
        .await
        .map(Json)
        .map_err(|e| {
            tracing::error!("Failed to load messages: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

/// GET /api/messages/search?q=term
pub async fn search_messages(
    State(state): State<AppState>,
    Query(params): Query<SearchQuery>,
) -> Result<Json<Vec<StoredMessage>>, StatusCode> {
    let query = params.q.trim().to_string();
    if query.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    run_blocking(&state.store, move |s| {
        s.search_messages(&query, MAX_SEARCH_RESULTS)
    })
    .await
    .map(Json)
    .map_err(|e| {
        tracing::error!("Message search failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// GET /api/users/online
/// Recently seen users that currently hold an open session.
pub async fn online_users(
    State(state): State<AppState>,
) -> Result<Json<Vec<User>>, StatusCode> {
    state.router.presence_snapshot().await.map(Json).map_err(|e| {
        tracing::error!("Failed to list online users: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// GET /api/statistics
pub async fn statistics(
    State(state): State<AppState>,
) -> Result<Json<StatisticsResponse>, StatusCode> {
    let internal = |e: crate::store::StoreError| {
        tracing::error!("Failed to build statistics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    };

    let totals = run_blocking(&state.store, |s| s.statistics())
        .await
        .map_err(internal)?;
    let recent_messages = run_blocking(&state.store, |s| s.recent_messages(DEFAULT_LIMIT))
        .await
        .map_err(internal)?;
    let online_users = state.router.presence_snapshot().await.map_err(internal)?;

    Ok(Json(StatisticsResponse {
        user_count: totals.user_count,
        message_count: totals.message_count,
        active_user_count: state.presence.active_count(),
        online_users,
        recent_messages,
    }))
}

/// GET /api/title
pub async fn get_title(State(state): State<AppState>) -> Json<TitleBody> {
    Json(TitleBody {
        title: state.chat_title.read().await.clone(),
    })
}

/// POST /api/title
/// Rename the room and tell everyone connected.
pub async fn set_title(
    State(state): State<AppState>,
    Json(body): Json<TitleBody>,
) -> Result<Json<TitleUpdated>, StatusCode> {
    let title = body.title.trim().to_string();
    if title.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    *state.chat_title.write().await = title.clone();
    tracing::info!(title = %title, "Chat title changed");

    let notice = OutboundMessage::system(
        format!("Chat title changed to {title}"),
        state.clock.now(),
    );
    state.hub.broadcast(&notice).await;

    Ok(Json(TitleUpdated {
        success: true,
        title,
    }))
}
