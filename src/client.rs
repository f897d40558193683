//! Client-side synchronization for a single conversation.
//!
//! [`ChatApi`] wraps the HTTP surface; [`ChatSession`] keeps a live
//! connection to the relay and a merged view of one conversation.

mod api;
mod session;

use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::media;

pub use api::ChatApi;
pub use session::{ChatSession, ConversationView, MediaAttachment, merge_history};

pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("could not encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid base url {0:?}")]
    InvalidBaseUrl(String),
    #[error("not connected to the chat server")]
    NotConnected,
    #[error("outbound queue is full")]
    Busy,
    #[error("message has neither text nor media")]
    EmptyMessage,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Origin of the chat server, e.g. `http://localhost:3001`.
    pub base_url: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ClientConfig {
    pub fn new(base_url: &str) -> Self {
        ClientConfig {
            base_url: media::normalize_origin(base_url),
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }

    pub(crate) fn base(&self) -> Result<Url, ClientError> {
        let url = Url::parse(&self.base_url)
            .map_err(|_| ClientError::InvalidBaseUrl(self.base_url.clone()))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            _ => Err(ClientError::InvalidBaseUrl(self.base_url.clone())),
        }
    }

    /// Live endpoint: `http` becomes `ws`, `https` becomes `wss`.
    pub fn ws_url(&self) -> Result<String, ClientError> {
        let mut url = self.base()?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::InvalidBaseUrl(self.base_url.clone()))?;
        Ok(format!("{}/ws", url.as_str().trim_end_matches('/')))
    }

    /// Fetchable URLs for a stored `mediaUrl` value.
    pub fn resolve_media(&self, media_url: &str) -> Vec<String> {
        media::resolve_media_urls(&self.base_url, media_url)
    }
}
