use std::collections::VecDeque;

use crate::address::Address;
use crate::network::message::Packet;

/// Identifies one connection slot. An address may hold both a registration
/// connection and a normal one at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub address: Address,
    pub is_register: bool,
}

impl ConnectionKey {
    pub fn new(address: Address, is_register: bool) -> Self {
        Self {
            address,
            is_register,
        }
    }
}

/// Outbound state for one remote node
#[derive(Debug)]
pub struct NeighborConnection {
    address: Address,
    /// Reserved for root-registration traffic; broadcasts never use it
    is_register: bool,
    outbox: VecDeque<Packet>,
}

impl NeighborConnection {
    pub fn new(address: Address, is_register: bool) -> Self {
        Self {
            address,
            is_register,
            outbox: VecDeque::new(),
        }
    }

    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.address, self.is_register)
    }

    pub fn is_register(&self) -> bool {
        self.is_register
    }

    pub fn enqueue(&mut self, packet: Packet) {
        self.outbox.push_back(packet);
    }

    pub fn pending(&self) -> usize {
        self.outbox.len()
    }

    /// Take every queued packet in FIFO order.
    pub fn take_outbox(&mut self) -> Vec<Packet> {
        self.outbox.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbox_is_fifo() {
        let me = Address::new([10, 0, 0, 1], 1);
        let mut conn = NeighborConnection::new(Address::new([10, 0, 0, 2], 2), false);
        conn.enqueue(Packet::join(me));
        conn.enqueue(Packet::message(me, "one"));
        conn.enqueue(Packet::message(me, "two"));
        assert_eq!(conn.pending(), 3);

        let drained = conn.take_outbox();
        assert_eq!(conn.pending(), 0);
        assert_eq!(drained[0], Packet::join(me));
        assert_eq!(drained[2], Packet::message(me, "two"));
    }

    #[test]
    fn test_key_distinguishes_register_slot() {
        let addr = Address::new([10, 0, 0, 2], 2);
        let normal = NeighborConnection::new(addr, false);
        let register = NeighborConnection::new(addr, true);
        assert_ne!(normal.key(), register.key());
        assert_eq!(normal.key().address, register.key().address);
    }
}
