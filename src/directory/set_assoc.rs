// Bounded set-associative directory. Line addresses map onto `sets` sets of `ways`
// entries each. Allocating a new address in a full set first reuses an entry that has no
// sharers and no pins; failing that it evicts the least recently used unpinned entry and
// passes it to the eviction hook so the controller can back-invalidate its sharers. When
// every way of the set is pinned by a live transaction the allocation fails and the
// caller has to retry later.

//! Set-associative directory with LRU replacement.

use crate::core::{Address, CoherenceError, CoherenceResult};

use super::{Directory, DirectoryEntry, EvictionHook, SharingVector};

pub struct SetAssociativeDirectory {
    sets: Vec<Vec<DirectoryEntry>>,
    ways: usize,
    block_shift: u32,
    hook: Option<EvictionHook>,
    next_generation: u64,
    clock: u64,
    evictions: u64,
}

impl SetAssociativeDirectory {
    pub fn new(sets: usize, ways: usize, block_size: u64) -> CoherenceResult<Self> {
        if sets == 0 || ways == 0 {
            return Err(CoherenceError::Config {
                reason: format!("set-associative directory needs non-zero geometry, got {sets}x{ways}"),
            });
        }
        if !block_size.is_power_of_two() {
            return Err(CoherenceError::Config {
                reason: format!("block size {block_size} is not a power of two"),
            });
        }
        Ok(Self {
            sets: (0..sets).map(|_| Vec::with_capacity(ways)).collect(),
            ways,
            block_shift: block_size.trailing_zeros(),
            hook: None,
            next_generation: 0,
            clock: 0,
            evictions: 0,
        })
    }

    pub fn ways(&self) -> usize {
        self.ways
    }

    pub fn num_sets(&self) -> usize {
        self.sets.len()
    }

    /// Entries evicted so far.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    fn set_index(&self, address: Address) -> usize {
        ((address >> self.block_shift) % self.sets.len() as u64) as usize
    }

    fn bump_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    /// Make room in `set`, returning false if every way is pinned.
    fn make_room(&mut self, set: usize) -> bool {
        if self.sets[set].len() < self.ways {
            return true;
        }
        if let Some(pos) = self.sets[set].iter().position(DirectoryEntry::is_removable) {
            self.sets[set].swap_remove(pos);
            return true;
        }
        let victim = self.sets[set]
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.pins() == 0)
            .min_by_key(|(_, entry)| entry.last_use)
            .map(|(pos, _)| pos);
        let Some(pos) = victim else {
            return false;
        };
        let victim = self.sets[set].swap_remove(pos);
        self.evictions += 1;
        log::debug!(
            "{}: evicting {:#x} with sharers {:?} from set {}",
            self.name(),
            victim.address(),
            victim.sharers(),
            set
        );
        if let Some(hook) = self.hook.as_mut() {
            hook(victim);
        }
        true
    }
}

impl Directory for SetAssociativeDirectory {
    fn name(&self) -> &'static str {
        "SetAssociativeDirectory"
    }

    fn find(&self, address: Address) -> Option<&DirectoryEntry> {
        self.sets[self.set_index(address)]
            .iter()
            .find(|entry| entry.address() == address)
    }

    fn find_mut(&mut self, address: Address) -> Option<&mut DirectoryEntry> {
        let set = self.set_index(address);
        self.sets[set]
            .iter_mut()
            .find(|entry| entry.address() == address)
    }

    fn allocate(&mut self, address: Address) -> Option<&mut DirectoryEntry> {
        let set = self.set_index(address);
        self.clock += 1;
        let now = self.clock;
        let pos = match self.sets[set].iter().position(|e| e.address() == address) {
            Some(pos) => pos,
            None => {
                if !self.make_room(set) {
                    return None;
                }
                let generation = self.bump_generation();
                self.sets[set].push(DirectoryEntry::new(address, generation));
                self.sets[set].len() - 1
            }
        };
        let entry = &mut self.sets[set][pos];
        entry.last_use = now;
        Some(entry)
    }

    fn remove(&mut self, address: Address) -> Option<DirectoryEntry> {
        let set = self.set_index(address);
        let pos = self.sets[set].iter().position(|e| e.address() == address)?;
        Some(self.sets[set].swap_remove(pos))
    }

    fn eviction_requirement(&self, address: Address) -> u32 {
        let set = &self.sets[self.set_index(address)];
        let needs_victim = set.len() >= self.ways
            && !set.iter().any(|e| e.address() == address)
            && !set.iter().any(DirectoryEntry::is_removable);
        u32::from(needs_victim)
    }

    fn set_eviction_hook(&mut self, hook: EvictionHook) {
        self.hook = Some(hook);
    }

    fn len(&self) -> usize {
        self.sets.iter().map(Vec::len).sum()
    }

    fn entries(&self) -> Vec<&DirectoryEntry> {
        let mut entries: Vec<_> = self.sets.iter().flatten().collect();
        entries.sort_by_key(|entry| entry.generation());
        entries
    }

    fn insert_entry(&mut self, address: Address, sharers: SharingVector) -> CoherenceResult<()> {
        let set = self.set_index(address);
        if let Some(pos) = self.sets[set].iter().position(|e| e.address() == address) {
            self.sets[set].swap_remove(pos);
        }
        if self.sets[set].len() >= self.ways {
            return Err(CoherenceError::Config {
                reason: format!("entry {address:#x} does not fit in set {set} of {}", self.name()),
            });
        }
        let generation = self.bump_generation();
        self.sets[set].push(DirectoryEntry::with_sharers(address, generation, sharers));
        Ok(())
    }

    fn clear(&mut self) {
        for set in &mut self.sets {
            set.clear();
        }
    }
}
