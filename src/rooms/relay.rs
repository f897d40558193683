use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    history::HistoryStore,
    media,
    message::{ChatUser, IncomingMessage, Message, ServerFrame},
};

use super::table::{ConnectionId, DeliveryFailure, Outbound, RoomTable};

const COMMAND_CAPACITY: usize = 256;

/// Room table plus history store. Owned by exactly one event loop.
pub struct Relay {
    store: HistoryStore,
    rooms: RoomTable,
}

impl Relay {
    pub fn new(store: HistoryStore) -> Self {
        Relay {
            store,
            rooms: RoomTable::default(),
        }
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    pub fn connect(&mut self, conn: ConnectionId, outbound: Outbound) {
        self.rooms.insert(conn, outbound);
        debug!(%conn, connections = self.rooms.connection_count(), "connection registered");
    }

    pub fn join(&mut self, conn: ConnectionId, identity: &str) {
        if identity.trim().is_empty() {
            debug!(%conn, "ignoring join with blank identity");
            return;
        }
        if self.rooms.join(conn, identity) {
            info!(%conn, "{identity} joined");
        } else {
            debug!(%conn, "join from unknown connection");
        }
    }

    /// Validates, persists and fans out one inbound message.
    ///
    /// Returns how many connections the message was queued for. Invalid
    /// messages are dropped without persistence or delivery.
    pub fn on_message(&mut self, conn: ConnectionId, incoming: IncomingMessage) -> usize {
        let Some(mut message) = incoming.into_message() else {
            debug!(%conn, "dropping invalid chat message");
            return 0;
        };

        if let Some(url) = message.media_url.take() {
            let relative = media::to_relative_url(&url);
            if !media::is_relative(&relative) {
                warn!(%conn, "media reference kept absolute: {relative}");
            }
            message.media_url = Some(relative);
        }

        let key = message.conversation_key();
        if let Err(e) = self.store.append(key.clone(), message.clone()) {
            error!("message in {key} kept in memory only: {e}");
        } else {
            debug!("stored message in {key}");
        }

        self.fan_out(message)
    }

    fn fan_out(&self, message: Message) -> usize {
        let recipients = self
            .rooms
            .recipients(&[message.receiver.as_str(), message.sender.as_str()]);

        let mut delivered = 0;
        for recipient in recipients {
            match self.rooms.deliver(recipient, ServerFrame::ChatMessage(message.clone())) {
                Ok(()) => delivered += 1,
                Err(DeliveryFailure::Full) => {
                    warn!(conn = %recipient, "outbound queue full, dropping frame");
                }
                Err(failure) => {
                    debug!(conn = %recipient, ?failure, "connection gone, dropping frame");
                }
            }
        }
        delivered
    }

    pub fn disconnect(&mut self, conn: ConnectionId) {
        let left = self.rooms.remove(conn);
        if !left.is_empty() {
            info!(%conn, "{} left", left.join(", "));
        }
    }

    pub fn history(&self, a: &str, b: &str) -> Vec<Message> {
        self.store.read_between(a, b).to_vec()
    }

    pub fn chat_users(&self, username: &str) -> Vec<ChatUser> {
        self.store.chat_users(username)
    }

    pub fn room_size(&self, identity: &str) -> usize {
        self.rooms.room_size(identity)
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Connect { conn, outbound } => self.connect(conn, outbound),
            Command::Join { conn, identity } => self.join(conn, &identity),
            Command::Message { conn, message } => {
                self.on_message(conn, message);
            }
            Command::Disconnect { conn } => self.disconnect(conn),
            Command::History { a, b, reply } => {
                let _ = reply.send(self.history(&a, &b));
            }
            Command::ChatUsers { username, reply } => {
                let _ = reply.send(self.chat_users(&username));
            }
            Command::RoomSize { identity, reply } => {
                let _ = reply.send(self.room_size(&identity));
            }
        }
    }
}

pub enum Command {
    Connect { conn: ConnectionId, outbound: Outbound },
    Join { conn: ConnectionId, identity: String },
    Message { conn: ConnectionId, message: IncomingMessage },
    Disconnect { conn: ConnectionId },
    History { a: String, b: String, reply: oneshot::Sender<Vec<Message>> },
    ChatUsers { username: String, reply: oneshot::Sender<Vec<ChatUser>> },
    RoomSize { identity: String, reply: oneshot::Sender<usize> },
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("relay event loop is not running")]
pub struct RelayClosed;

/// Cloneable entry point into the relay's event loop.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<Command>,
}

/// Starts the single event loop that owns `relay`.
///
/// The loop ends once every [`RelayHandle`] has been dropped.
pub fn spawn(relay: Relay) -> (RelayHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
    let task = tokio::spawn(run(relay, rx));
    (RelayHandle { tx }, task)
}

async fn run(mut relay: Relay, mut rx: mpsc::Receiver<Command>) {
    while let Some(command) = rx.recv().await {
        relay.handle(command);
    }
    info!("relay loop stopped");
}

impl RelayHandle {
    async fn send(&self, command: Command) -> Result<(), RelayClosed> {
        self.tx.send(command).await.map_err(|_| RelayClosed)
    }

    async fn ask<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, RelayClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply)).await?;
        rx.await.map_err(|_| RelayClosed)
    }

    pub async fn connect(&self, conn: ConnectionId, outbound: Outbound) -> Result<(), RelayClosed> {
        self.send(Command::Connect { conn, outbound }).await
    }

    pub async fn join(&self, conn: ConnectionId, identity: String) -> Result<(), RelayClosed> {
        self.send(Command::Join { conn, identity }).await
    }

    pub async fn message(&self, conn: ConnectionId, message: IncomingMessage) -> Result<(), RelayClosed> {
        self.send(Command::Message { conn, message }).await
    }

    pub async fn disconnect(&self, conn: ConnectionId) -> Result<(), RelayClosed> {
        self.send(Command::Disconnect { conn }).await
    }

    pub async fn history(&self, a: String, b: String) -> Result<Vec<Message>, RelayClosed> {
        self.ask(|reply| Command::History { a, b, reply }).await
    }

    pub async fn chat_users(&self, username: String) -> Result<Vec<ChatUser>, RelayClosed> {
        self.ask(|reply| Command::ChatUsers { username, reply }).await
    }

    /// Number of live connections currently joined as `identity`.
    pub async fn room_size(&self, identity: String) -> Result<usize, RelayClosed> {
        self.ask(|reply| Command::RoomSize { identity, reply }).await
    }
}
