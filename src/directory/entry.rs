//! Directory entries.

use crate::core::{Address, CoherenceError, CoherenceResult, NodeId};

use super::sharing::{SharingState, SharingVector};

/// Opaque reference to a live directory entry.
///
/// The generation distinguishes an entry from a later one created for the same
/// address after the first was destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    address: Address,
    generation: u64,
}

impl EntryHandle {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Sharer-tracking record for one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    address: Address,
    sharers: SharingVector,
    state: SharingState,
    /// Live transactions referencing this entry.
    pins: u32,
    /// Creation order within the owning directory.
    generation: u64,
    pub(crate) last_use: u64,
}

impl DirectoryEntry {
    pub fn new(address: Address, generation: u64) -> Self {
        Self {
            address,
            sharers: SharingVector::new(),
            state: SharingState::Zero,
            pins: 0,
            generation,
            last_use: 0,
        }
    }

    pub fn with_sharers(address: Address, generation: u64, sharers: SharingVector) -> Self {
        let mut entry = Self::new(address, generation);
        entry.sharers = sharers;
        entry.refresh();
        entry
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn sharers(&self) -> SharingVector {
        self.sharers
    }

    pub fn state(&self) -> SharingState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn handle(&self) -> EntryHandle {
        EntryHandle {
            address: self.address,
            generation: self.generation,
        }
    }

    pub fn matches(&self, handle: &EntryHandle) -> bool {
        self.address == handle.address && self.generation == handle.generation
    }

    pub fn is_sharer(&self, node: NodeId) -> bool {
        self.sharers.contains(node)
    }

    pub fn add_sharer(&mut self, node: NodeId) {
        self.sharers.add(node);
        self.refresh();
    }

    /// Make `node` the only sharer.
    pub fn add_exclusive_sharer(&mut self, node: NodeId) {
        self.sharers.clear();
        self.sharers.add(node);
        self.refresh();
    }

    pub fn remove_sharer(&mut self, node: NodeId) {
        self.sharers.remove(node);
        self.refresh();
    }

    /// Collapse the sharer set to `node`, which must already be a sharer.
    pub fn make_exclusive(&mut self, node: NodeId) -> CoherenceResult<()> {
        if !self.sharers.contains(node) {
            return Err(CoherenceError::NotASharer {
                node,
                address: self.address,
            });
        }
        self.add_exclusive_sharer(node);
        Ok(())
    }

    /// A snoop found no copy at `node`; stop tracking it.
    pub fn failed_snoop(&mut self, node: NodeId) {
        self.remove_sharer(node);
    }

    pub fn pins(&self) -> u32 {
        self.pins
    }

    pub fn pin(&mut self) {
        self.pins += 1;
    }

    pub fn unpin(&mut self) {
        self.pins = self.pins.saturating_sub(1);
    }

    /// No sharers and no live transaction: the entry may be destroyed.
    pub fn is_removable(&self) -> bool {
        self.state == SharingState::Zero && self.pins == 0
    }

    fn refresh(&mut self) {
        self.state = self.sharers.state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_follows_mutations() {
        let mut entry = DirectoryEntry::new(0x100, 0);
        entry.add_sharer(3);
        assert_eq!(entry.state(), SharingState::One);
        entry.add_sharer(4);
        assert_eq!(entry.state(), SharingState::Many);
        entry.make_exclusive(4).unwrap();
        assert_eq!(entry.sharers().to_list(), vec![4]);
        assert_eq!(entry.state(), SharingState::One);
        entry.failed_snoop(4);
        assert_eq!(entry.state(), SharingState::Zero);
    }

    #[test]
    fn test_make_exclusive_requires_sharer() {
        let mut entry = DirectoryEntry::new(0x40, 0);
        entry.add_sharer(1);
        let err = entry.make_exclusive(2).unwrap_err();
        assert!(matches!(err, CoherenceError::NotASharer { node: 2, address: 0x40 }));
        assert_eq!(entry.sharers().to_list(), vec![1]);
    }

    #[test]
    fn test_removable_needs_no_pins() {
        let mut entry = DirectoryEntry::new(0x40, 7);
        entry.pin();
        assert!(!entry.is_removable());
        entry.unpin();
        assert!(entry.is_removable());
        assert!(entry.matches(&entry.handle()));
        assert_eq!(entry.handle().generation(), 7);
    }
}
