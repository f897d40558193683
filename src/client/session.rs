use std::time::Duration;

use futures_util::{FutureExt, Sink, SinkExt, StreamExt, future::BoxFuture};
use rand::Rng;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    task::JoinHandle,
};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tracing::{debug, info, warn};

use super::{ChatApi, ClientConfig, ClientError};
use crate::message::{
    ClientFrame, IncomingMessage, MediaType, Message, ServerFrame, conversation_key, now_timestamp,
};

const OUTBOUND_CAPACITY: usize = 64;

/// Snapshot of a conversation as the UI should render it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationView {
    pub messages: Vec<Message>,
    /// True until the first history fetch has settled.
    pub loading: bool,
    pub connected: bool,
}

/// Media previously stored through [`ChatApi::upload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaAttachment {
    pub media_type: MediaType,
    pub url: String,
}

type Outbound = Option<mpsc::Sender<ClientFrame>>;

/// A live view of the conversation between `self_id` and `peer_id`.
///
/// History fetch and the live connection run in a background task which
/// reconnects with backoff. Dropping the session stops it.
pub struct ChatSession {
    self_id: String,
    peer_id: String,
    api: ChatApi,
    view: watch::Receiver<ConversationView>,
    outbound: watch::Receiver<Outbound>,
    task: JoinHandle<()>,
}

impl ChatSession {
    pub fn open(
        config: ClientConfig,
        self_id: impl Into<String>,
        peer_id: impl Into<String>,
    ) -> Result<Self, ClientError> {
        let self_id = self_id.into();
        let peer_id = peer_id.into();
        let api = ChatApi::new(&config)?;
        let ws_url = config.ws_url()?;

        let (view_tx, view) = watch::channel(ConversationView {
            loading: true,
            ..Default::default()
        });
        let (outbound_tx, outbound) = watch::channel(None);

        let sync = SyncTask {
            api: api.clone(),
            ws_url,
            key: conversation_key(&self_id, &peer_id),
            self_id: self_id.clone(),
            peer_id: peer_id.clone(),
            view: view_tx,
            outbound: outbound_tx,
            backoff: Backoff::new(config.initial_backoff, config.max_backoff),
        };
        let task = tokio::spawn(sync.run());

        Ok(ChatSession {
            self_id,
            peer_id,
            api,
            view,
            outbound,
            task,
        })
    }

    pub fn api(&self) -> &ChatApi {
        &self.api
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationView> {
        self.view.clone()
    }

    pub fn view(&self) -> ConversationView {
        self.view.borrow().clone()
    }

    /// Emits a message on the live connection.
    ///
    /// Nothing is appended locally; the message shows up once the relay
    /// echoes it back. Fails with [`ClientError::NotConnected`] while the
    /// connection is down and is never retried.
    pub fn send(&self, text: &str, media: Option<MediaAttachment>) -> Result<(), ClientError> {
        let (media_type, media_url) = match media {
            Some(attachment) => (Some(attachment.media_type), Some(attachment.url)),
            None => (None, None),
        };
        let message = IncomingMessage {
            sender: Some(self.self_id.clone()),
            receiver: Some(self.peer_id.clone()),
            text: Some(text.to_string()),
            media_type,
            media_url,
            timestamp: Some(now_timestamp()),
        };
        if !message.is_valid() {
            return Err(ClientError::EmptyMessage);
        }

        let outbound = self.outbound.borrow().clone();
        let outbound = outbound.ok_or(ClientError::NotConnected)?;
        outbound
            .try_send(ClientFrame::ChatMessage(message))
            .map_err(|e| match e {
                TrySendError::Full(_) => ClientError::Busy,
                TrySendError::Closed(_) => ClientError::NotConnected,
            })
    }

    pub fn close(self) {
        self.task.abort();
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Folds a fetched history into the visible list without removing anything.
///
/// When the visible messages are an ordered subsequence of `fetched`, the
/// fetched list is adopted as-is. Otherwise fetched messages that are not yet
/// visible are appended in their fetched order.
pub fn merge_history(visible: &mut Vec<Message>, fetched: Vec<Message>) {
    let mut remaining = fetched.iter();
    if visible.iter().all(|m| remaining.any(|f| f == m)) {
        *visible = fetched;
        return;
    }

    let mut pool: Vec<Option<&Message>> = visible.iter().map(Some).collect();
    let mut missing = Vec::new();
    for message in fetched {
        match pool.iter_mut().find(|slot| slot.is_some_and(|v| *v == message)) {
            Some(slot) => *slot = None,
            None => missing.push(message),
        }
    }
    visible.extend(missing);
}

#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max,
            current: initial,
        }
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Next delay, shaved by up to 20% of jitter so it never exceeds the cap.
    fn next_delay(&mut self) -> Duration {
        let base = self.current.min(self.max);
        self.current = (self.current * 2).min(self.max);
        let jitter: f64 = rand::rng().random_range(0.0..=0.2);
        base.mul_f64(1.0 - jitter)
    }
}

type HistoryFetch = BoxFuture<'static, Result<Vec<Message>, ClientError>>;

/// Resolves once the pending fetch settles and clears the slot; never resolves while it is empty.
async fn settled(fetch: &mut Option<HistoryFetch>) -> Result<Vec<Message>, ClientError> {
    match fetch {
        Some(pending) => {
            let result = pending.await;
            *fetch = None;
            result
        }
        None => std::future::pending().await,
    }
}

struct SyncTask {
    api: ChatApi,
    ws_url: String,
    key: String,
    self_id: String,
    peer_id: String,
    view: watch::Sender<ConversationView>,
    outbound: watch::Sender<Outbound>,
    backoff: Backoff,
}

impl SyncTask {
    async fn run(mut self) {
        let mut fetch = Some(self.fetch_history());
        loop {
            let connect = tokio_tungstenite::connect_async(self.ws_url.clone());
            match self.alongside(&mut fetch, connect).await {
                Ok((stream, _response)) => {
                    self.backoff.reset();
                    info!("connected to {} as {}", self.ws_url, self.self_id);
                    if let Err(e) = self.drive(stream, &mut fetch).await {
                        warn!("connection to {} lost: {e}", self.ws_url);
                    }
                    self.outbound.send_replace(None);
                    self.view.send_modify(|view| view.connected = false);
                }
                Err(e) => warn!("could not connect to {}: {e}", self.ws_url),
            }

            let delay = self.backoff.next_delay();
            debug!("reconnecting in {delay:?}");
            self.alongside(&mut fetch, tokio::time::sleep(delay)).await;
        }
    }

    fn fetch_history(&self) -> HistoryFetch {
        let api = self.api.clone();
        let self_id = self.self_id.clone();
        let peer_id = self.peer_id.clone();
        async move { api.history(&self_id, &peer_id).await }.boxed()
    }

    fn apply_history(&self, history: Result<Vec<Message>, ClientError>) {
        match history {
            Ok(fetched) => self.view.send_modify(|view| {
                merge_history(&mut view.messages, fetched);
                view.loading = false;
            }),
            Err(e) => {
                warn!("history fetch for {} failed: {e}", self.key);
                self.view.send_modify(|view| view.loading = false);
            }
        }
    }

    /// Drives `fut` to completion while applying the pending history fetch as soon as it lands.
    async fn alongside<F: Future>(&self, fetch: &mut Option<HistoryFetch>, fut: F) -> F::Output {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                output = &mut fut => return output,
                history = settled(fetch) => self.apply_history(history),
            }
        }
    }

    async fn drive<S>(&self, stream: S, fetch: &mut Option<HistoryFetch>) -> Result<(), ClientError>
    where
        S: Sink<WsMessage, Error = tungstenite::Error>
            + futures_util::Stream<Item = Result<WsMessage, tungstenite::Error>>
            + Unpin,
    {
        let (mut write, mut read) = stream.split();
        send_frame(&mut write, &ClientFrame::Join(self.self_id.clone())).await?;

        // Anything stored before the join went out was not fanned out to us.
        if fetch.is_none() {
            *fetch = Some(self.fetch_history());
        }

        let (tx, mut rx) = mpsc::channel(OUTBOUND_CAPACITY);
        self.outbound.send_replace(Some(tx));
        self.view.send_modify(|view| view.connected = true);

        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => send_frame(&mut write, &frame).await?,
                    None => return Ok(()),
                },
                incoming = read.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => self.on_text(text.as_str()),
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                history = settled(fetch) => self.apply_history(history),
            }
        }
    }

    fn on_text(&self, text: &str) {
        match serde_json::from_str::<ServerFrame>(text) {
            Ok(ServerFrame::ChatMessage(message)) => {
                if message.conversation_key() == self.key {
                    self.view.send_modify(|view| view.messages.push(message));
                }
            }
            Err(e) => debug!("ignoring unreadable frame: {e}"),
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: &ClientFrame) -> Result<(), ClientError>
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(frame)?;
    sink.send(WsMessage::Text(text.into())).await?;
    Ok(())
}
