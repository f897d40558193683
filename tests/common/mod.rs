#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{oneshot, watch},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message as WsMessage,
};

use pawchat::{
    AppState,
    history::{HistoryStore, JsonFile},
    message::{Message, ServerFrame},
    rooms::{self, Relay, RelayHandle},
    upload::UploadConfig,
};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Holds back or refuses websocket upgrades while leaving plain HTTP alone.
#[derive(Clone, Default)]
pub struct WsGate {
    refuse: Arc<AtomicBool>,
    delay_ms: Arc<AtomicU64>,
}

impl WsGate {
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn admit(self, request: Request, next: Next) -> Response {
        if request.uri().path() == "/ws" {
            if self.refuse.load(Ordering::SeqCst) {
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
        next.run(request).await
    }
}

/// TCP forwarder that can cut every proxied connection and refuse new ones.
pub struct FlakyProxy {
    pub base_url: String,
    online: watch::Sender<bool>,
}

impl FlakyProxy {
    pub async fn start(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
        let addr = listener.local_addr().expect("proxy addr");
        let (online, gate) = watch::channel(true);

        tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                if !*gate.borrow() {
                    continue;
                }
                let mut gate = gate.clone();
                tokio::spawn(async move {
                    let Ok(mut outbound) = TcpStream::connect(upstream).await else {
                        return;
                    };
                    tokio::select! {
                        _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {}
                        _ = gate.wait_for(|online| !*online) => {}
                    }
                });
            }
        });

        FlakyProxy {
            base_url: format!("http://{addr}"),
            online,
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
    }
}

pub struct TestServer {
    pub base_url: String,
    pub addr: SocketAddr,
    pub gate: WsGate,
    pub relay: RelayHandle,
    pub dir: TempDir,
    _shutdown: oneshot::Sender<()>,
}

impl TestServer {
    pub fn history_path(&self) -> std::path::PathBuf {
        self.dir.path().join("history.json")
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub async fn connect(&self, identity: &str) -> Ws {
        let ws_url = format!("{}/ws", self.base_url.replacen("http://", "ws://", 1));
        let (mut ws, _) = connect_async(ws_url).await.expect("connect ws");

        let before = self.relay.room_size(identity.to_string()).await.expect("room size");
        send_json(&mut ws, json!({ "event": "join", "data": identity })).await;
        self.wait_for_room(identity, before + 1).await;
        ws
    }

    pub async fn wait_for_room(&self, identity: &str, size: usize) {
        for _ in 0..200 {
            if self.relay.room_size(identity.to_string()).await.expect("room size") >= size {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{identity} never reached {size} connection(s)");
    }

    pub async fn wait_for_empty_room(&self, identity: &str) {
        for _ in 0..200 {
            if self.relay.room_size(identity.to_string()).await.expect("room size") == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{identity} still has live connections");
    }

    pub async fn history(&self, a: &str, b: &str) -> Vec<Message> {
        reqwest::get(self.url(&format!("/chat/{a}/{b}")))
            .await
            .expect("history request")
            .json()
            .await
            .expect("history body")
    }
}

pub async fn start_server(max_upload_bytes: usize) -> TestServer {
    let dir = tempfile::tempdir().expect("tempdir");
    let upload_dir = dir.path().join("uploads");
    std::fs::create_dir_all(&upload_dir).expect("upload dir");

    let mut store = HistoryStore::new(JsonFile::new(dir.path().join("history.json")));
    store.load().expect("load history");
    let (relay, _task) = rooms::spawn(Relay::new(store));

    let gate = WsGate::default();
    let app = pawchat::app(AppState {
        relay: relay.clone(),
        uploads: UploadConfig {
            dir: upload_dir,
            max_bytes: max_upload_bytes,
        },
    })
    .layer(middleware::from_fn({
        let gate = gate.clone();
        move |request: Request, next: Next| gate.clone().admit(request, next)
    }));
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind server");
    let addr = listener.local_addr().expect("server addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    TestServer {
        base_url: format!("http://{addr}"),
        addr,
        gate,
        relay,
        dir,
        _shutdown: shutdown_tx,
    }
}

pub async fn send_json(ws: &mut Ws, frame: Value) {
    ws.send(WsMessage::Text(frame.to_string().into()))
        .await
        .expect("send frame");
}

pub async fn send_chat(ws: &mut Ws, data: Value) {
    send_json(ws, json!({ "event": "chat-message", "data": data })).await;
}

pub async fn recv_chat(ws: &mut Ws) -> Message {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let WsMessage::Text(text) = frame {
            let ServerFrame::ChatMessage(message) =
                serde_json::from_str(text.as_str()).expect("server frame");
            return message;
        }
    }
}

pub async fn assert_silent(ws: &mut Ws) {
    let next = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(next.is_err(), "expected no frame, got {next:?}");
}
