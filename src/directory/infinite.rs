//! Unbounded directory.
//!
//! Entries live in a hash map keyed by line address. Nothing is ever evicted; entries
//! disappear only once they have no sharers and no live transaction.

use hashbrown::HashMap;

use crate::core::{Address, CoherenceResult};

use super::{Directory, DirectoryEntry, EvictionHook, SharingVector};

pub struct InfiniteDirectory {
    entries: HashMap<Address, DirectoryEntry>,
    next_generation: u64,
}

impl InfiniteDirectory {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_generation: 0,
        }
    }

    fn bump_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }
}

impl Default for InfiniteDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory for InfiniteDirectory {
    fn name(&self) -> &'static str {
        "InfiniteDirectory"
    }

    fn find(&self, address: Address) -> Option<&DirectoryEntry> {
        self.entries.get(&address)
    }

    fn find_mut(&mut self, address: Address) -> Option<&mut DirectoryEntry> {
        self.entries.get_mut(&address)
    }

    fn allocate(&mut self, address: Address) -> Option<&mut DirectoryEntry> {
        if !self.entries.contains_key(&address) {
            let generation = self.bump_generation();
            self.entries
                .insert(address, DirectoryEntry::new(address, generation));
        }
        self.entries.get_mut(&address)
    }

    fn remove(&mut self, address: Address) -> Option<DirectoryEntry> {
        self.entries.remove(&address)
    }

    fn eviction_requirement(&self, _address: Address) -> u32 {
        0
    }

    // Never evicts, so the hook is never called.
    fn set_eviction_hook(&mut self, _hook: EvictionHook) {}

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn entries(&self) -> Vec<&DirectoryEntry> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.generation());
        entries
    }

    fn insert_entry(&mut self, address: Address, sharers: SharingVector) -> CoherenceResult<()> {
        let generation = self.bump_generation();
        self.entries.insert(
            address,
            DirectoryEntry::with_sharers(address, generation, sharers),
        );
        Ok(())
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MessageType;

    #[test]
    fn test_entries_in_creation_order() {
        let mut dir = InfiniteDirectory::new();
        for address in [0x300, 0x100, 0x200] {
            dir.insert_entry(address, SharingVector::from_nodes([1])).unwrap();
        }
        let order: Vec<_> = dir.entries().iter().map(|e| e.address()).collect();
        assert_eq!(order, vec![0x300, 0x100, 0x200]);
    }

    #[test]
    fn test_recreated_entry_gets_new_generation() {
        let mut dir = InfiniteDirectory::new();
        let first = dir.lookup(1, 0x40, MessageType::ReadReq).unwrap().handle.unwrap();
        dir.release(first);
        assert!(dir.is_empty());
        let second = dir.lookup(1, 0x40, MessageType::ReadReq).unwrap().handle.unwrap();
        assert_ne!(first, second);
        // A stale handle does not unpin the new entry.
        dir.release(first);
        assert!(dir.find(0x40).is_some());
        dir.release(second);
        assert!(dir.is_empty());
    }

    #[test]
    fn test_never_requires_eviction() {
        let mut dir = InfiniteDirectory::new();
        for i in 0..1000u64 {
            dir.insert_entry(i * 64, SharingVector::from_nodes([(i % 16) as u16])).unwrap();
        }
        assert_eq!(dir.eviction_requirement(0xdead_0000), 0);
        assert_eq!(dir.len(), 1000);
    }
}
