use axum::{
    debug_handler,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::message::ClientFrame;

use super::relay::RelayHandle;

const OUTBOUND_CAPACITY: usize = 64;

#[debug_handler(state = crate::AppState)]
pub async fn relay_ws(State(relay): State<RelayHandle>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |stream| serve_connection(stream, relay))
}

async fn serve_connection(stream: WebSocket, relay: RelayHandle) {
    let conn = Uuid::now_v7();
    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    if relay.connect(conn, outbound_tx).await.is_err() {
        return;
    }

    let (mut sender, mut receiver) = stream.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sender.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let reader = relay.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let frame: ClientFrame = match msg {
                WsMessage::Text(text) => match serde_json::from_str(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(%conn, "ignoring malformed frame: {e}");
                        continue;
                    }
                },
                WsMessage::Binary(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(%conn, "ignoring malformed frame: {e}");
                        continue;
                    }
                },
                WsMessage::Close(_) => break,
                _ => continue,
            };

            let forwarded = match frame {
                ClientFrame::Join(identity) => reader.join(conn, identity).await,
                ClientFrame::ChatMessage(message) => reader.message(conn, message).await,
            };
            if forwarded.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    };

    let _ = relay.disconnect(conn).await;
    debug!(%conn, "connection closed");
}
