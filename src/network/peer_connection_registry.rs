use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::address::Address;
use crate::network::client::Transport;
use crate::network::message::Packet;
use crate::network::peer_connection::{ConnectionKey, NeighborConnection};
use crate::network::wire;

/// Result of one flush pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    /// Packets lost because their connection failed mid-batch
    pub dropped: usize,
    pub failed: Vec<ConnectionKey>,
}

/// Table of neighbor connections keyed by (address, is_register).
///
/// The lock is never held across a send: flushing takes the queued packets
/// out, releases the table, talks to the network, then re-locks to discard
/// connections whose send failed.
pub struct PeerConnectionRegistry {
    connections: Mutex<HashMap<ConnectionKey, NeighborConnection>>,
}

impl PeerConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Open a connection slot. Returns false if it already existed.
    pub fn add(&self, address: Address, is_register: bool) -> bool {
        let key = ConnectionKey::new(address, is_register);
        let mut connections = self.connections.lock();
        if connections.contains_key(&key) {
            return false;
        }
        connections.insert(key, NeighborConnection::new(address, is_register));
        debug!(
            "✅ Added {} connection to {}",
            if is_register { "register" } else { "normal" },
            address
        );
        true
    }

    pub fn remove(&self, address: Address, is_register: bool) -> Option<NeighborConnection> {
        let removed = self
            .connections
            .lock()
            .remove(&ConnectionKey::new(address, is_register));
        if removed.is_some() {
            debug!("🔌 Removed connection to {}", address);
        }
        removed
    }

    pub fn contains(&self, address: Address, is_register: bool) -> bool {
        self.connections
            .lock()
            .contains_key(&ConnectionKey::new(address, is_register))
    }

    /// Queue a packet on an existing connection. Packets for unknown
    /// connections are dropped.
    pub fn enqueue(&self, address: Address, packet: Packet, is_register: bool) -> bool {
        let mut connections = self.connections.lock();
        match connections.get_mut(&ConnectionKey::new(address, is_register)) {
            Some(conn) => {
                conn.enqueue(packet);
                true
            }
            None => {
                debug!(
                    "No {} connection to {}, dropping {:?} packet",
                    if is_register { "register" } else { "normal" },
                    address,
                    packet.packet_type()
                );
                false
            }
        }
    }

    pub fn pending(&self, address: Address, is_register: bool) -> usize {
        self.connections
            .lock()
            .get(&ConnectionKey::new(address, is_register))
            .map(|c| c.pending())
            .unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Send every queued packet. With `only_register`, normal connections keep
    /// their queues untouched.
    pub async fn flush(&self, transport: &dyn Transport, only_register: bool) -> FlushReport {
        let batches: Vec<(ConnectionKey, Vec<Packet>)> = {
            let mut connections = self.connections.lock();
            connections
                .values_mut()
                .filter(|c| !only_register || c.is_register())
                .filter(|c| c.pending() > 0)
                .map(|c| (c.key(), c.take_outbox()))
                .collect()
        };

        let mut report = FlushReport::default();

        for (key, packets) in batches {
            let total = packets.len();
            let mut sent = 0;
            for packet in packets {
                match transport.send(key.address, wire::encode(&packet)).await {
                    Ok(()) => sent += 1,
                    Err(e) => {
                        warn!("❌ Send to {} failed: {}", key.address, e);
                        report.failed.push(key);
                        break;
                    }
                }
            }
            report.sent += sent;
            report.dropped += total - sent;
        }

        let mut connections = self.connections.lock();
        for key in &report.failed {
            connections.remove(key);
            debug!("🔌 Removed failed connection to {}", key.address);
        }

        report
    }
}

impl Default for PeerConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
