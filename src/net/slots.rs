//! Server connection slots
//!
//! Accepted connections are appended to a dense slot list in arrival order.
//! Slot `i` is exposed upstream as peer ID `i + 1`; peer ID 0 belongs to the
//! locally hosted player and never names a remote connection. A slot whose
//! connection went away is cleared but never removed or reused, so peer IDs
//! stay stable for the lifetime of the list.

use crate::net::driver::ConnectionHandle;

/// Peer identifier as seen by the upstream networking layer
pub type PeerId = u32;

/// Peer ID reserved for the locally hosted player
pub const LOCAL_PEER_ID: PeerId = 0;

/// Peer ID for a slot index
#[inline]
pub fn peer_id_for_slot(index: usize) -> PeerId {
    (index as PeerId) + 1
}

/// Slot index for a peer ID, `None` for the local peer
#[inline]
pub fn slot_for_peer_id(peer: PeerId) -> Option<usize> {
    peer.checked_sub(1).map(|index| index as usize)
}

/// Append-only list of server connections
#[derive(Debug, Default)]
pub struct ConnectionSlots {
    slots: Vec<Option<ConnectionHandle>>,
}

impl ConnectionSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
        }
    }

    /// Append an accepted connection, returning its peer ID
    pub fn push(&mut self, connection: ConnectionHandle) -> PeerId {
        self.slots.push(Some(connection));
        peer_id_for_slot(self.slots.len() - 1)
    }

    /// Live connection for a peer
    pub fn get(&self, peer: PeerId) -> Option<ConnectionHandle> {
        slot_for_peer_id(peer).and_then(|index| self.handle_at(index))
    }

    /// Live connection at a slot index
    pub fn handle_at(&self, index: usize) -> Option<ConnectionHandle> {
        self.slots.get(index).copied().flatten()
    }

    /// Clear a peer's slot, returning the connection it held
    pub fn clear(&mut self, peer: PeerId) -> Option<ConnectionHandle> {
        let index = slot_for_peer_id(peer)?;
        self.slots.get_mut(index).and_then(Option::take)
    }

    /// Number of slots ever assigned, cleared ones included
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of slots holding a live connection
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Live connections in slot order
    pub fn iter_live(&self) -> impl Iterator<Item = (PeerId, ConnectionHandle)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.map(|handle| (peer_id_for_slot(index), handle)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(index: u32) -> ConnectionHandle {
        ConnectionHandle::new(index, 0)
    }

    #[test]
    fn test_peer_id_mapping() {
        for index in 0..64usize {
            let peer = peer_id_for_slot(index);
            assert_eq!(peer, index as PeerId + 1);
            assert_ne!(peer, LOCAL_PEER_ID);
            assert_eq!(slot_for_peer_id(peer), Some(index));
        }
        assert_eq!(slot_for_peer_id(LOCAL_PEER_ID), None);
    }

    #[test]
    fn test_push_assigns_sequential_ids() {
        let mut slots = ConnectionSlots::new();
        for i in 0..8u32 {
            let peer = slots.push(handle(100 + i));
            assert_eq!(peer, i + 1);
        }
        assert_eq!(slots.len(), 8);
        assert_eq!(slots.get(1), Some(handle(100)));
        assert_eq!(slots.get(8), Some(handle(107)));
    }

    #[test]
    fn test_unknown_peer_lookup() {
        let mut slots = ConnectionSlots::new();
        slots.push(handle(1));

        assert_eq!(slots.get(LOCAL_PEER_ID), None);
        assert_eq!(slots.get(2), None);
        assert_eq!(slots.get(PeerId::MAX), None);
    }

    #[test]
    fn test_clear_keeps_slot() {
        let mut slots = ConnectionSlots::new();
        slots.push(handle(1));
        slots.push(handle(2));

        assert_eq!(slots.clear(1), Some(handle(1)));
        assert_eq!(slots.clear(1), None);
        assert_eq!(slots.get(1), None);
        assert_eq!(slots.len(), 2);
        assert_eq!(slots.live_count(), 1);

        // Cleared slots are never reused
        let peer = slots.push(handle(3));
        assert_eq!(peer, 3);
        assert_eq!(slots.get(1), None);
    }

    #[test]
    fn test_clear_unknown_peer() {
        let mut slots = ConnectionSlots::new();
        assert_eq!(slots.clear(LOCAL_PEER_ID), None);
        assert_eq!(slots.clear(5), None);
        assert!(slots.is_empty());
    }

    #[test]
    fn test_iter_live() {
        let mut slots = ConnectionSlots::with_capacity(4);
        slots.push(handle(10));
        slots.push(handle(11));
        slots.push(handle(12));
        slots.clear(2);

        let live: Vec<_> = slots.iter_live().collect();
        assert_eq!(live, vec![(1, handle(10)), (3, handle(12))]);
    }
}
