mod relay;
mod table;
mod ws;

use axum::{Router, routing::get};

use crate::AppState;

pub use relay::{Relay, RelayClosed, RelayHandle, spawn};
pub use table::ConnectionId;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws::relay_ws))
}
