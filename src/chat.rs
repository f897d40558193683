use axum::{
    Json, Router, debug_handler,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tracing::debug;

use crate::{AppResult, AppState, api_error, rooms::RelayHandle};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/chat/{user1}/{user2}", get(history))
        .route("/api/chat-users", get(chat_users))
}

#[debug_handler(state = AppState)]
async fn history(
    Path((user1, user2)): Path<(String, String)>,
    State(relay): State<RelayHandle>,
) -> AppResult<Response> {
    debug!("history requested for {user1} and {user2}");
    let messages = relay.history(user1, user2).await?;
    Ok(Json(messages).into_response())
}

#[derive(Deserialize)]
struct ChatUsersQuery {
    username: Option<String>,
}

#[debug_handler(state = AppState)]
async fn chat_users(
    Query(ChatUsersQuery { username }): Query<ChatUsersQuery>,
    State(relay): State<RelayHandle>,
) -> AppResult<Response> {
    let Some(username) = username.filter(|u| !u.trim().is_empty()) else {
        return Ok(api_error(StatusCode::BAD_REQUEST, "Missing username"));
    };

    let users = relay.chat_users(username).await?;
    Ok(Json(users).into_response())
}
