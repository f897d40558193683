//! Server configuration.
//!
//! Every option can come from the command line or from the environment
//! (a `.env` file is loaded first); command-line values win.

use std::path::PathBuf;

use clap::Parser;

use crate::upload::{DEFAULT_MAX_UPLOAD_BYTES, UploadConfig};

/// Realtime chat relay: live one-to-one messaging, history and media uploads.
#[derive(Parser, Debug, Clone)]
#[command(name = "pawchat", version, about)]
pub struct ServerConfig {
    /// Address the HTTP and WebSocket server binds to
    #[arg(long, short = 'b', env = "PAWCHAT_BIND", default_value = "0.0.0.0:3001")]
    pub bind: String,

    /// JSON document holding the chat history
    #[arg(long, env = "PAWCHAT_HISTORY_FILE", default_value = "chat-history.json")]
    pub history_file: PathBuf,

    /// Directory uploaded media is stored in and served from
    #[arg(long, env = "PAWCHAT_UPLOAD_DIR", default_value = "uploads")]
    pub upload_dir: PathBuf,

    /// Largest accepted upload, in bytes
    #[arg(long, env = "PAWCHAT_MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    pub max_upload_bytes: usize,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "PAWCHAT_LOG", default_value = "info")]
    pub log_level: String,
}

impl ServerConfig {
    pub fn uploads(&self) -> UploadConfig {
        UploadConfig {
            dir: self.upload_dir.clone(),
            max_bytes: self.max_upload_bytes,
        }
    }
}
