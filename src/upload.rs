use std::{
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use axum::{
    Json, Router, debug_handler,
    extract::{DefaultBodyLimit, Multipart, State, multipart::Field},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use serde::{Deserialize, Serialize};
use tower_http::services::ServeDir;
use tracing::info;

use crate::{AppResult, AppState, api_error, media::UPLOAD_BASE_PATH, message::MediaType};

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 30 * 1024 * 1024;

// Room for multipart boundaries and headers on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub dir: PathBuf,
    pub max_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub url: String,
    pub media_type: MediaType,
}

pub fn router(config: &UploadConfig) -> Router<AppState> {
    let body_limit = DefaultBodyLimit::max(config.max_bytes.saturating_add(MULTIPART_OVERHEAD));
    Router::new()
        .route("/upload", post(upload).layer(body_limit))
        .nest_service(UPLOAD_BASE_PATH, ServeDir::new(&config.dir))
}

#[debug_handler(state = AppState)]
async fn upload(State(config): State<UploadConfig>, mut multipart: Multipart) -> AppResult<Response> {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Ok(api_error(e.status(), e.body_text())),
        };
        if field.name() != Some("file") {
            continue;
        }

        let mime = field.content_type().unwrap_or_default().to_string();
        let Some(media_type) = MediaType::from_mime(&mime) else {
            return Ok(api_error(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "Only image/video allowed",
            ));
        };

        let name = stored_name(field.file_name(), now_millis());
        let data = match read_limited(field, config.max_bytes).await {
            Ok(data) => data,
            Err(rejection) => return Ok(rejection),
        };

        tokio::fs::write(config.dir.join(&name), &data).await?;
        info!("uploaded {name} ({}, {} bytes)", media_type.as_str(), data.len());

        return Ok(Json(UploadResponse {
            url: format!("{UPLOAD_BASE_PATH}/{name}"),
            media_type,
        })
        .into_response());
    }

    Ok(api_error(StatusCode::BAD_REQUEST, "No file"))
}

async fn read_limited(mut field: Field<'_>, max_bytes: usize) -> Result<Vec<u8>, Response> {
    let mut data = Vec::new();
    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return Ok(data),
            Err(e) => return Err(api_error(e.status(), e.body_text())),
        };
        if data.len() + chunk.len() > max_bytes {
            return Err(api_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("file exceeds the {max_bytes} byte limit"),
            ));
        }
        data.extend_from_slice(&chunk);
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// `<basename with whitespace runs as _>_<millis><ext>`, never containing a path separator.
fn stored_name(original: Option<&str>, millis: u128) -> String {
    let file = original
        .unwrap_or_default()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let (stem, ext) = match file.rfind('.') {
        Some(idx) if idx > 0 => file.split_at(idx),
        _ => (file, ""),
    };

    let mut base = String::with_capacity(stem.len());
    let mut in_space = false;
    for c in stem.chars() {
        if c.is_whitespace() {
            if !in_space {
                base.push('_');
            }
            in_space = true;
        } else {
            base.push(c);
            in_space = false;
        }
    }
    if base.is_empty() {
        base.push_str("upload");
    }

    format!("{base}_{millis}{ext}")
}
