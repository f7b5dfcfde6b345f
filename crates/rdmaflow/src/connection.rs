//! Connection state machine and the per-context connection table.
//!
//! Every connection, whichever protocol created it, moves through the same
//! [`ConnectionState`] machine. Transitions are checked against a single table so the
//! client, server, bridged and exported paths cannot drift apart.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::address::AddressLease;
use crate::error::{RdmaError, Result};
use crate::fabric::PeerRef;
use crate::task::UserData;

/// State of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Created but no handshake issued yet.
    Idle,
    /// Client side: looking for the listener behind the address.
    ResolvingAddress,
    /// Server side: request received, waiting for accept or reject.
    AwaitingAccept,
    /// Handshake in flight.
    Connecting,
    /// Ready for operation tasks.
    Connected,
    /// Local disconnect issued, waiting for the peer to acknowledge.
    Disconnecting,
    /// Torn down after being connected.
    Disconnected,
    /// Handshake failed, timed out or was rejected.
    Failed,
}

impl ConnectionState {
    /// Whether the connection has reached a final state.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }

    /// The transition table shared by every entry protocol.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, ResolvingAddress)
                | (Idle, AwaitingAccept)
                | (Idle, Connecting)
                | (Idle, Connected)
                | (Idle, Failed)
                | (ResolvingAddress, Connecting)
                | (ResolvingAddress, Failed)
                | (AwaitingAccept, Connecting)
                | (AwaitingAccept, Connected)
                | (AwaitingAccept, Failed)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Connected, Disconnected)
                | (Disconnecting, Disconnected)
        )
    }
}

/// Handle to a connection, unique within its context.
///
/// The serial changes every time a table slot is reused, so a stale id never
/// aliases a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId {
    slot: u32,
    serial: u32,
}

impl ConnectionId {
    pub(crate) fn new(slot: u32, serial: u32) -> Self {
        Self { slot, serial }
    }

    pub(crate) fn slot(self) -> u32 {
        self.slot
    }

    pub(crate) fn serial(self) -> u32 {
        self.serial
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}.{}", self.slot, self.serial)
    }
}

/// How a connection came into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionOrigin {
    /// `connect_to_addr`.
    Client,
    /// Request received on a listening port.
    Server,
    /// Adopted from an external connection manager.
    Bridged,
    /// Created by `export`, bound by `connect`.
    Exported,
}

#[derive(Debug)]
pub(crate) struct Connection {
    pub id: ConnectionId,
    pub origin: ConnectionOrigin,
    pub state: ConnectionState,
    pub lease: Option<AddressLease>,
    pub user_data: UserData,
    pub peer: Option<PeerRef>,
    pub deadline: Option<Instant>,
    pub private_data: Vec<u8>,
    pub failure: Option<RdmaError>,
    /// Exported connections: key the peer must present when binding.
    pub session_key: Option<[u8; 16]>,
    /// Exported connections: the peer bound to us before we called `connect`.
    pub peer_bound: Option<PeerRef>,
    /// Set once the terminal event has been reported; reaped on the next poll.
    pub reap: bool,
}

impl Connection {
    pub fn transition(&mut self, next: ConnectionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(RdmaError::unexpected(format!(
                "{} cannot move from {:?} to {:?}",
                self.id, self.state, next
            )));
        }
        debug!(conn = %self.id, from = ?self.state, to = ?next, "connection state");
        self.state = next;
        Ok(())
    }
}

struct Slot {
    serial: u32,
    conn: Option<Connection>,
}

/// Fixed-capacity arena of connections.
pub(crate) struct ConnectionTable {
    slots: Vec<Slot>,
    capacity: usize,
    live: usize,
}

impl ConnectionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            capacity,
            live: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn insert(&mut self, origin: ConnectionOrigin, user_data: UserData) -> Result<ConnectionId> {
        if self.live >= self.capacity {
            return Err(RdmaError::ResourceExhausted {
                resource: "connection table",
                capacity: self.capacity,
            });
        }
        let slot = match self.slots.iter().position(|s| s.conn.is_none()) {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot { serial: 0, conn: None });
                self.slots.len() - 1
            }
        };
        let entry = &mut self.slots[slot];
        entry.serial = entry.serial.wrapping_add(1);
        let id = ConnectionId::new(slot as u32, entry.serial);
        entry.conn = Some(Connection {
            id,
            origin,
            state: ConnectionState::Idle,
            lease: None,
            user_data,
            peer: None,
            deadline: None,
            private_data: Vec::new(),
            failure: None,
            session_key: None,
            peer_bound: None,
            reap: false,
        });
        self.live += 1;
        Ok(id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        let slot = self.slots.get(id.slot() as usize)?;
        if slot.serial != id.serial() {
            return None;
        }
        slot.conn.as_ref()
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        let slot = self.slots.get_mut(id.slot() as usize)?;
        if slot.serial != id.serial() {
            return None;
        }
        slot.conn.as_mut()
    }

    pub fn lookup(&self, id: ConnectionId) -> Result<&Connection> {
        self.get(id)
            .ok_or_else(|| RdmaError::invalid(format!("unknown connection {}", id)))
    }

    pub fn lookup_mut(&mut self, id: ConnectionId) -> Result<&mut Connection> {
        self.get_mut(id)
            .ok_or_else(|| RdmaError::invalid(format!("unknown connection {}", id)))
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let slot = self.slots.get_mut(id.slot() as usize)?;
        if slot.serial != id.serial() {
            return None;
        }
        let conn = slot.conn.take();
        if conn.is_some() {
            self.live -= 1;
        }
        conn
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.slots
            .iter()
            .filter_map(|s| s.conn.as_ref().map(|c| c.id))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.slots.iter().filter_map(|s| s.conn.as_ref())
    }

    /// Drops connections whose terminal event was reported by an earlier poll.
    pub fn reap(&mut self) -> usize {
        let mut reaped = 0;
        for slot in &mut self.slots {
            if slot.conn.as_ref().map(|c| c.reap).unwrap_or(false) {
                slot.conn = None;
                reaped += 1;
            }
        }
        self.live -= reaped;
        reaped
    }
}
