// Eviction buffers hold lines that are leaving the tile: replacements from the tile
// cache on their way to memory, and directory victims whose sharers still have to be
// back-invalidated. Both are ReservedQueues so a transaction can claim a slot at
// admission and fill it later. An entry is parked until the controller starts draining
// it; a parked cache entry can still be reclaimed by a request for the same line, a
// draining one cannot, and requests for it have to wait until the drain finishes. A
// replacement finishes when its writeback is sent. A victim finishes only when every
// sharer it back-invalidated has acked.

//! Cache and directory eviction buffers.

use crate::core::{Address, CoherenceError, CoherenceResult, MessageType, NodeId, ReservedQueue};
use crate::directory::SharingVector;
use crate::protocol::CacheState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictEntry {
    pub address: Address,
    /// Message sent when the entry drains.
    pub kind: MessageType,
    /// Tile cache state before the line was evicted.
    pub state: CacheState,
    /// Private caches to back-invalidate (directory victims only).
    pub sharers: SharingVector,
    /// Back-invalidate acks still outstanding.
    pub pending: SharingVector,
    pub draining: bool,
}

impl EvictEntry {
    /// A line replaced from the tile cache.
    pub fn replacement(address: Address, kind: MessageType, state: CacheState) -> Self {
        Self {
            address,
            kind,
            state,
            sharers: SharingVector::new(),
            pending: SharingVector::new(),
            draining: false,
        }
    }

    /// A directory entry evicted to make room for another line.
    pub fn victim(address: Address, sharers: SharingVector) -> Self {
        Self {
            address,
            kind: MessageType::Invalidate,
            state: CacheState::Invalid,
            sharers,
            pending: SharingVector::new(),
            draining: false,
        }
    }
}

pub struct EvictBuffer {
    queue: ReservedQueue<EvictEntry>,
    draining: usize,
}

impl EvictBuffer {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            queue: ReservedQueue::new(name, capacity),
            draining: 0,
        }
    }

    pub fn name(&self) -> &str {
        self.queue.name()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn reserved(&self) -> usize {
        self.queue.reserved()
    }

    pub fn has_space(&self, n: usize) -> bool {
        self.queue.has_space(n)
    }

    pub fn reserve(&mut self, n: usize) -> CoherenceResult<()> {
        self.queue.reserve(n)
    }

    pub fn unreserve(&mut self, n: usize) -> CoherenceResult<()> {
        self.queue.unreserve(n)
    }

    /// Fill a slot claimed earlier.
    pub fn commit(&mut self, entry: EvictEntry) -> CoherenceResult<()> {
        log::trace!("{}: parked {:#x} ({})", self.name(), entry.address, entry.kind);
        self.queue.enqueue_reserved(entry)
    }

    /// True while a slot is free or about to be freed by a drain in progress.
    pub fn free_slot_pending(&self) -> bool {
        self.queue.capacity() + self.draining > self.queue.reserved()
    }

    /// Entries being drained.
    pub fn draining(&self) -> usize {
        self.draining
    }

    /// True when a parked entry has to be drained to free a slot.
    pub fn drain_due(&self) -> bool {
        !self.free_slot_pending() && self.has_undrained()
    }

    pub fn has_undrained(&self) -> bool {
        self.queue.iter().any(|e| !e.draining)
    }

    /// Mark the oldest parked entry as draining and return a copy of it. Its current
    /// sharers become the acks the drain waits for.
    pub fn begin_drain(&mut self) -> Option<EvictEntry> {
        let entry = self.queue.find_mut(|e| !e.draining)?;
        entry.draining = true;
        entry.pending = entry.sharers;
        self.draining += 1;
        Some(entry.clone())
    }

    /// True when the draining entry for `address` still waits for an ack from `node`.
    pub fn awaits_ack(&self, address: Address, node: NodeId) -> bool {
        self.queue
            .find(|e| e.address == address && e.draining && e.pending.contains(node))
            .is_some()
    }

    /// Note a back-invalidate ack; returns how many are still outstanding.
    pub fn record_ack(&mut self, address: Address, node: NodeId) -> CoherenceResult<u32> {
        let entry = self
            .queue
            .find_mut(|e| e.address == address && e.draining)
            .ok_or(CoherenceError::MissingEntry { address })?;
        entry.pending.remove(node);
        Ok(entry.pending.count())
    }

    /// True when `node` is still recorded as a sharer of the buffered `address`.
    pub fn has_sharer(&self, address: Address, node: NodeId) -> bool {
        self.queue
            .find(|e| e.address == address && e.sharers.contains(node))
            .is_some()
    }

    /// Forget `node` as a sharer of the buffered `address`; pending acks are kept.
    pub fn remove_sharer(&mut self, address: Address, node: NodeId) {
        if let Some(entry) = self.queue.find_mut(|e| e.address == address) {
            entry.sharers.remove(node);
        }
    }

    /// Remove the draining entry for `address`.
    pub fn finish_drain(&mut self, address: Address) -> CoherenceResult<EvictEntry> {
        let entry = self
            .queue
            .remove_first(|e| e.address == address && e.draining)
            .ok_or(CoherenceError::MissingEntry { address })?;
        self.draining -= 1;
        Ok(entry)
    }

    pub fn contains(&self, address: Address) -> bool {
        self.queue.find(|e| e.address == address).is_some()
    }

    pub fn is_draining(&self, address: Address) -> bool {
        self.queue
            .find(|e| e.address == address && e.draining)
            .is_some()
    }

    /// Take back a parked entry for `address`.
    pub fn reclaim(&mut self, address: Address) -> Option<EvictEntry> {
        self.queue
            .remove_first(|e| e.address == address && !e.draining)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EvictEntry> {
        self.queue.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_park_drain_finish() {
        let mut eb = EvictBuffer::new("ceb", 2);
        eb.reserve(1).unwrap();
        eb.commit(EvictEntry::replacement(0x40, MessageType::EvictDirty, CacheState::Modified))
            .unwrap();
        assert!(eb.has_undrained());
        assert!(eb.free_slot_pending());

        eb.reserve(1).unwrap();
        eb.commit(EvictEntry::replacement(0x80, MessageType::EvictClean, CacheState::Shared))
            .unwrap();
        assert!(!eb.free_slot_pending());
        assert!(eb.drain_due());

        let first = eb.begin_drain().unwrap();
        assert_eq!(first.address, 0x40);
        assert!(eb.free_slot_pending());
        assert_eq!(eb.draining(), 1);
        assert!(eb.is_draining(0x40));
        assert!(eb.reclaim(0x40).is_none(), "draining entries stay put");

        assert_eq!(eb.finish_drain(0x40).unwrap().kind, MessageType::EvictDirty);
        assert!(eb.finish_drain(0x40).is_err());
        assert_eq!(eb.len(), 1);
    }

    #[test]
    fn test_reclaim_parked_entry() {
        let mut eb = EvictBuffer::new("ceb", 1);
        eb.reserve(1).unwrap();
        eb.commit(EvictEntry::replacement(0x40, MessageType::EvictClean, CacheState::Shared))
            .unwrap();
        let entry = eb.reclaim(0x40).unwrap();
        assert_eq!(entry.state, CacheState::Shared);
        assert!(eb.is_empty());
        assert!(eb.has_space(1));
    }

    #[test]
    fn test_victim_drains_until_every_ack() {
        let mut eb = EvictBuffer::new("deb", 1);
        eb.reserve(1).unwrap();
        eb.commit(EvictEntry::victim(0x40, SharingVector::from_nodes([1, 3])))
            .unwrap();
        assert!(!eb.awaits_ack(0x40, 1), "nothing sent while parked");

        // Node 3 evicts before the back-invalidate goes out.
        assert!(eb.has_sharer(0x40, 3));
        eb.remove_sharer(0x40, 3);
        let victim = eb.begin_drain().unwrap();
        assert_eq!(victim.sharers.to_list(), vec![1]);
        assert!(eb.awaits_ack(0x40, 1));
        assert!(!eb.awaits_ack(0x40, 3));

        assert_eq!(eb.record_ack(0x40, 1).unwrap(), 0);
        assert!(!eb.awaits_ack(0x40, 1));
        assert!(eb.contains(0x40), "the caller finishes the drain");
        eb.finish_drain(0x40).unwrap();
        assert!(eb.record_ack(0x40, 1).is_err());
    }

    #[test]
    fn test_commit_requires_claim() {
        let mut eb = EvictBuffer::new("deb", 1);
        assert!(eb
            .commit(EvictEntry::victim(0x40, SharingVector::from_nodes([1])))
            .is_err());
    }
}
