pub mod chat;
pub mod client;
pub mod config;
pub mod history;
pub mod media;
pub mod message;
pub mod rooms;
pub mod upload;

use axum::{
    Json, Router, debug_handler,
    extract::FromRef,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

use rooms::RelayHandle;
use upload::UploadConfig;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub relay: RelayHandle,
    pub uploads: UploadConfig,
}

/// The full HTTP + WebSocket surface of the chat server.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(chat::router())
        .merge(rooms::router())
        .merge(upload::router(&state.uploads))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[debug_handler]
async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

/// A `{"error": ...}` body with the given status.
pub fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

pub type AppResult<T> = Result<T, AppError>;
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("request failed: {:#}", self.0);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string())
    }
}

impl From<String> for AppError {
    fn from(err: String) -> Self {
        Self(anyhow::Error::msg(err))
    }
}

impl From<&str> for AppError {
    fn from(err: &str) -> Self {
        Self(anyhow::Error::msg(err.to_owned()))
    }
}

macro_rules! apperr_impl {
    ($E:ty) => {
        impl From<$E> for AppError {
            fn from(err: $E) -> Self {
                Self(anyhow::Error::from(err))
            }
        }
    };
}

apperr_impl!(std::io::Error);
apperr_impl!(serde_json::Error);
apperr_impl!(rooms::RelayClosed);
apperr_impl!(history::StoreError);
