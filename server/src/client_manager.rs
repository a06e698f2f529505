//! Connected session tracking for one worker process
//!
//! This module handles the server-side bookkeeping of connected clients:
//! - Session id allocation that stays unique across the worker pool
//! - Outbound packet queues, one per connection
//! - Join state (a connection only receives world traffic after `hello`)
//! - Capacity enforcement

use log::{debug, info};
use shared::{Packet, SessionId};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc;

const SESSION_SEQ_BITS: u32 = 24;
const SESSION_SEQ_MASK: u32 = (1 << SESSION_SEQ_BITS) - 1;

/// Builds a session id from the worker slot and a per-worker sequence number.
///
/// The worker id occupies the high byte so two workers sharing the port never
/// hand out the same id.
pub fn session_id_for(worker_id: u32, seq: u32) -> SessionId {
    (worker_id << SESSION_SEQ_BITS) | (seq & SESSION_SEQ_MASK)
}

/// A connected client and the queue feeding its socket writer
#[derive(Debug)]
pub struct ConnectedClient {
    pub id: SessionId,
    pub addr: SocketAddr,
    /// Player name, set once the client has sent `hello`
    pub name: Option<String>,
    outbound: mpsc::UnboundedSender<Packet>,
}

impl ConnectedClient {
    pub fn new(id: SessionId, addr: SocketAddr, outbound: mpsc::UnboundedSender<Packet>) -> Self {
        Self {
            id,
            addr,
            name: None,
            outbound,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.name.is_some()
    }

    /// Queues a packet for this client. Returns false when the writer is gone.
    pub fn send(&self, packet: Packet) -> bool {
        self.outbound.send(packet).is_ok()
    }
}

/// Manages all connections accepted by this worker
pub struct ClientManager {
    clients: HashMap<SessionId, ConnectedClient>,
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            max_clients,
        }
    }

    /// Registers a new connection. Returns false if the worker is at capacity
    /// or the id is already taken.
    pub fn add_client(
        &mut self,
        id: SessionId,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Packet>,
    ) -> bool {
        if self.clients.len() >= self.max_clients || self.clients.contains_key(&id) {
            return false;
        }

        info!("Client {} connected from {}", id, addr);
        self.clients
            .insert(id, ConnectedClient::new(id, addr, outbound));
        true
    }

    pub fn remove_client(&mut self, id: SessionId) -> Option<ConnectedClient> {
        let removed = self.clients.remove(&id);
        if let Some(client) = &removed {
            info!("Client {} disconnected", client.id);
        }
        removed
    }

    /// Marks a connection as joined. Returns false for unknown or already joined clients.
    pub fn mark_joined(&mut self, id: SessionId, name: &str) -> bool {
        match self.clients.get_mut(&id) {
            Some(client) if !client.is_joined() => {
                client.name = Some(name.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn is_joined(&self, id: SessionId) -> bool {
        self.clients
            .get(&id)
            .map(ConnectedClient::is_joined)
            .unwrap_or(false)
    }

    pub fn send_to(&self, id: SessionId, packet: Packet) -> bool {
        match self.clients.get(&id) {
            Some(client) => client.send(packet),
            None => false,
        }
    }

    /// Queues a packet for every joined client except `exclude`.
    /// Returns the number of clients it was queued for.
    pub fn broadcast(&self, packet: &Packet, exclude: Option<SessionId>) -> usize {
        let mut delivered = 0;
        for client in self.clients.values() {
            if !client.is_joined() || Some(client.id) == exclude {
                continue;
            }
            if client.send(packet.clone()) {
                delivered += 1;
            } else {
                debug!("Dropping broadcast to closed client {}", client.id);
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
