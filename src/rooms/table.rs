use std::collections::{BTreeSet, HashMap};

use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::message::ServerFrame;

pub type ConnectionId = Uuid;
pub type Outbound = mpsc::Sender<ServerFrame>;

struct Connection {
    outbound: Outbound,
    identities: BTreeSet<String>,
}

/// Why a frame could not be queued for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    Unknown,
    Full,
    Closed,
}

/// Live connections and the identities ("rooms") they joined.
#[derive(Default)]
pub struct RoomTable {
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<String, BTreeSet<ConnectionId>>,
}

impl RoomTable {
    pub fn insert(&mut self, conn: ConnectionId, outbound: Outbound) {
        self.connections.insert(
            conn,
            Connection {
                outbound,
                identities: BTreeSet::new(),
            },
        );
    }

    /// Returns false when the connection is unknown.
    pub fn join(&mut self, conn: ConnectionId, identity: &str) -> bool {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return false;
        };
        connection.identities.insert(identity.to_string());
        self.rooms.entry(identity.to_string()).or_default().insert(conn);
        true
    }

    /// Forgets the connection and every membership it held.
    pub fn remove(&mut self, conn: ConnectionId) -> Vec<String> {
        let Some(connection) = self.connections.remove(&conn) else {
            return Vec::new();
        };
        for identity in &connection.identities {
            if let Some(members) = self.rooms.get_mut(identity) {
                members.remove(&conn);
                if members.is_empty() {
                    self.rooms.remove(identity);
                }
            }
        }
        connection.identities.into_iter().collect()
    }

    /// Connections joined under any of `identities`, each listed once.
    pub fn recipients(&self, identities: &[&str]) -> BTreeSet<ConnectionId> {
        identities
            .iter()
            .filter_map(|identity| self.rooms.get(*identity))
            .flatten()
            .copied()
            .collect()
    }

    pub fn room_size(&self, identity: &str) -> usize {
        self.rooms.get(identity).map_or(0, BTreeSet::len)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn deliver(&self, conn: ConnectionId, frame: ServerFrame) -> Result<(), DeliveryFailure> {
        let connection = self.connections.get(&conn).ok_or(DeliveryFailure::Unknown)?;
        connection.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryFailure::Full,
            TrySendError::Closed(_) => DeliveryFailure::Closed,
        })
    }
}
