// The directory tracks, for every line homed at this tile, which private caches hold a
// copy. This module defines the Directory trait the controller programs against and the
// request/response bookkeeping every storage strategy shares: a lookup pins the entry for
// the lifetime of the transaction that made it, request/response pairs add, upgrade or
// remove sharers, snoop responses remove sharers that no longer hold the line, and
// entries with no sharers and no pins are destroyed. Two strategies implement the storage
// primitives: an unbounded hash-map directory (the reference behavior) and a bounded
// set-associative directory that evicts victims through a hook when a set is full.

//! Sharer-tracking directory.
//!
//! # Strategies
//!
//! - [`InfiniteDirectory`] - unbounded, never evicts a non-empty entry
//! - [`SetAssociativeDirectory`] - `sets x ways` table with LRU victims
//!
//! Both are used through the [`Directory`] trait; [`DirectoryKind`] selects one at
//! construction.

pub mod entry;
pub mod infinite;
pub mod set_assoc;
pub mod sharing;
pub mod snapshot;

pub use entry::{DirectoryEntry, EntryHandle};
pub use infinite::InfiniteDirectory;
pub use set_assoc::SetAssociativeDirectory;
pub use sharing::{SharingState, SharingVector, MAX_NUM_SHARERS};
pub use snapshot::{load_snapshot, save_snapshot, DirectorySnapshot, SnapshotEntry};

use std::fmt;
use std::str::FromStr;

use crate::core::{Address, CoherenceError, CoherenceResult, MessageType, NodeId};

/// Callback receiving entries evicted to make room for a new address.
pub type EvictionHook = Box<dyn FnMut(DirectoryEntry)>;

/// Result of a request lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryLookup {
    pub sharers: SharingVector,
    pub state: SharingState,
    /// `None` when no entry could be allocated (every way of the set is pinned).
    pub handle: Option<EntryHandle>,
}

/// Result of a snoop-side lookup; never allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnoopLookup {
    pub sharers: SharingVector,
    pub state: SharingState,
    pub handle: Option<EntryHandle>,
    /// False when the directory holds no entry for the line.
    pub valid: bool,
}

/// Storage strategy for directory entries.
pub trait Directory {
    fn name(&self) -> &'static str;

    fn find(&self, address: Address) -> Option<&DirectoryEntry>;

    fn find_mut(&mut self, address: Address) -> Option<&mut DirectoryEntry>;

    /// Find the entry for `address` or create it, evicting through the hook if needed.
    fn allocate(&mut self, address: Address) -> Option<&mut DirectoryEntry>;

    fn remove(&mut self, address: Address) -> Option<DirectoryEntry>;

    /// Eviction-buffer slots an allocation of `address` would need right now.
    fn eviction_requirement(&self, address: Address) -> u32;

    fn set_eviction_hook(&mut self, hook: EvictionHook);

    fn len(&self) -> usize;

    /// Live entries in creation order.
    fn entries(&self) -> Vec<&DirectoryEntry>;

    /// Insert a restored entry; used when reloading a snapshot.
    fn insert_entry(&mut self, address: Address, sharers: SharingVector) -> CoherenceResult<()>;

    fn clear(&mut self);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up (creating if needed) the entry for a request and pin it.
    fn lookup(
        &mut self,
        node: NodeId,
        address: Address,
        kind: MessageType,
    ) -> CoherenceResult<DirectoryLookup> {
        check_node(node)?;
        if !kind.is_request() {
            return Err(CoherenceError::InvalidMessage {
                kind,
                operation: "directory lookup",
            });
        }
        let lookup = match self.allocate(address) {
            Some(entry) => {
                entry.pin();
                DirectoryLookup {
                    sharers: entry.sharers(),
                    state: entry.state(),
                    handle: Some(entry.handle()),
                }
            }
            None => DirectoryLookup {
                sharers: SharingVector::new(),
                state: SharingState::Zero,
                handle: None,
            },
        };
        log::trace!(
            "{}: lookup {:#x} for {} from node {} -> {:?}",
            self.name(),
            address,
            kind,
            node,
            lookup.state
        );
        Ok(lookup)
    }

    /// Look up the entry a snoop response or eviction refers to.
    fn snoop_lookup(&mut self, node: NodeId, address: Address, kind: MessageType) -> SnoopLookup {
        let lookup = match self.find(address) {
            Some(entry) => SnoopLookup {
                sharers: entry.sharers(),
                state: entry.state(),
                handle: Some(entry.handle()),
                valid: true,
            },
            None => SnoopLookup {
                sharers: SharingVector::new(),
                state: SharingState::Zero,
                handle: None,
                valid: false,
            },
        };
        log::trace!(
            "{}: snoop lookup {:#x} for {} from node {} -> valid={}",
            self.name(),
            address,
            kind,
            node,
            lookup.valid
        );
        lookup
    }

    /// Apply the outcome of a request (or an eviction) to the entry.
    fn process_request_response(
        &mut self,
        node: NodeId,
        request: MessageType,
        response: Option<MessageType>,
        address: Address,
    ) -> CoherenceResult<()> {
        check_node(node)?;
        if request.is_eviction() {
            if let Some(entry) = self.find_mut(address) {
                entry.remove_sharer(node);
            }
            self.prune(address);
            return Ok(());
        }

        let response = response.ok_or(CoherenceError::InvalidMessage {
            kind: request,
            operation: "request without response",
        })?;
        if response == MessageType::NonAllocatingStoreReply {
            return Ok(());
        }

        if self.find(address).is_none() {
            self.allocate(address)
                .ok_or(CoherenceError::MissingEntry { address })?;
        }
        let entry = self
            .find_mut(address)
            .ok_or(CoherenceError::MissingEntry { address })?;
        match (request, response) {
            (MessageType::UpgradeReq, MessageType::UpgradeReply) => entry.make_exclusive(node),
            (_, MessageType::MissReply) => {
                entry.add_sharer(node);
                Ok(())
            }
            (_, MessageType::MissReplyWritable | MessageType::MissReplyDirty) => {
                entry.add_exclusive_sharer(node);
                Ok(())
            }
            (_, kind) => Err(CoherenceError::InvalidMessage {
                kind,
                operation: "process_request_response",
            }),
        }
    }

    /// Apply a snoop response from `node`.
    fn process_snoop_response(
        &mut self,
        node: NodeId,
        response: MessageType,
        address: Address,
    ) -> CoherenceResult<()> {
        check_node(node)?;
        let Some(entry) = self.find_mut(address) else {
            return Ok(());
        };
        match response {
            MessageType::InvalidateAck | MessageType::InvUpdateAck => entry.remove_sharer(node),
            MessageType::ReturnNAck => entry.failed_snoop(node),
            MessageType::ReturnReply
            | MessageType::ReturnReplyDirty
            | MessageType::DowngradeAck
            | MessageType::DownUpdateAck => {}
            kind => {
                return Err(CoherenceError::InvalidMessage {
                    kind,
                    operation: "process_snoop_response",
                })
            }
        }
        self.prune(address);
        Ok(())
    }

    /// Drop the pin `handle` holds, destroying the entry if nothing else needs it.
    fn release(&mut self, handle: EntryHandle) {
        if let Some(entry) = self.find_mut(handle.address()) {
            if entry.matches(&handle) {
                entry.unpin();
            }
        }
        self.prune(handle.address());
    }

    /// Destroy the entry for `address` if it has no sharers and no pins.
    fn prune(&mut self, address: Address) {
        if self.find(address).is_some_and(DirectoryEntry::is_removable) {
            self.remove(address);
        }
    }
}

fn check_node(node: NodeId) -> CoherenceResult<()> {
    if (node as usize) < MAX_NUM_SHARERS {
        Ok(())
    } else {
        Err(CoherenceError::InvalidNode { node })
    }
}

/// Directory storage strategy selected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectoryKind {
    #[default]
    Infinite,
    SetAssociative { sets: usize, ways: usize },
}

impl DirectoryKind {
    /// Build the directory; `block_size` must be a power of two.
    pub fn build(self, block_size: u64) -> CoherenceResult<Box<dyn Directory>> {
        Ok(match self {
            DirectoryKind::Infinite => Box::new(InfiniteDirectory::new()),
            DirectoryKind::SetAssociative { sets, ways } => {
                Box::new(SetAssociativeDirectory::new(sets, ways, block_size)?)
            }
        })
    }
}

impl FromStr for DirectoryKind {
    type Err = CoherenceError;

    /// Parses `infinite` or `set:<sets>x<ways>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoherenceError::Config {
            reason: format!("unknown directory type '{s}' (expected 'infinite' or 'set:<sets>x<ways>')"),
        };
        if s.eq_ignore_ascii_case("infinite") {
            return Ok(DirectoryKind::Infinite);
        }
        let geometry = s.strip_prefix("set:").ok_or_else(invalid)?;
        let (sets, ways) = geometry.split_once('x').ok_or_else(invalid)?;
        let sets = sets.trim().parse().map_err(|_| invalid())?;
        let ways = ways.trim().parse().map_err(|_| invalid())?;
        Ok(DirectoryKind::SetAssociative { sets, ways })
    }
}

impl fmt::Display for DirectoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectoryKind::Infinite => write!(f, "infinite"),
            DirectoryKind::SetAssociative { sets, ways } => write!(f, "set:{sets}x{ways}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_directory_kind() {
        assert_eq!("infinite".parse::<DirectoryKind>().unwrap(), DirectoryKind::Infinite);
        assert_eq!(
            "set:64x4".parse::<DirectoryKind>().unwrap(),
            DirectoryKind::SetAssociative { sets: 64, ways: 4 }
        );
        assert!("set:64".parse::<DirectoryKind>().is_err());
        assert!("cuckoo".parse::<DirectoryKind>().is_err());
        assert_eq!(DirectoryKind::SetAssociative { sets: 2, ways: 8 }.to_string(), "set:2x8");
    }

    fn exercise(dir: &mut dyn Directory) {
        let lookup = dir.lookup(3, 0x100, MessageType::ReadReq).unwrap();
        assert_eq!(lookup.state, SharingState::Zero);
        let handle = lookup.handle.unwrap();
        dir.process_request_response(3, MessageType::ReadReq, Some(MessageType::MissReply), 0x100)
            .unwrap();
        dir.release(handle);
        let entry = dir.find(0x100).unwrap();
        assert_eq!(entry.sharers().to_list(), vec![3]);
        assert_eq!(entry.state(), SharingState::One);

        dir.process_request_response(5, MessageType::ReadReq, Some(MessageType::MissReply), 0x100)
            .unwrap();
        dir.process_request_response(5, MessageType::UpgradeReq, Some(MessageType::UpgradeReply), 0x100)
            .unwrap();
        assert_eq!(dir.find(0x100).unwrap().sharers().to_list(), vec![5]);

        dir.process_snoop_response(5, MessageType::DowngradeAck, 0x100).unwrap();
        assert_eq!(dir.find(0x100).unwrap().state(), SharingState::One);
        dir.process_request_response(5, MessageType::EvictClean, None, 0x100)
            .unwrap();
        assert!(dir.find(0x100).is_none(), "empty unpinned entry is destroyed");
    }

    #[test]
    fn test_request_response_bookkeeping() {
        exercise(&mut InfiniteDirectory::new());
        exercise(&mut SetAssociativeDirectory::new(4, 2, 64).unwrap());
    }

    #[test]
    fn test_snoop_lookup_does_not_allocate() {
        let mut dir = InfiniteDirectory::new();
        let lookup = dir.snoop_lookup(1, 0x80, MessageType::EvictClean);
        assert!(!lookup.valid);
        assert!(dir.is_empty());
    }

    #[test]
    fn test_pinned_entry_survives_until_release() {
        let mut dir = InfiniteDirectory::new();
        let handle = dir.lookup(2, 0x40, MessageType::WriteReq).unwrap().handle.unwrap();
        dir.prune(0x40);
        assert!(dir.find(0x40).is_some());
        dir.release(handle);
        assert!(dir.find(0x40).is_none());
    }

    #[test]
    fn test_invalid_combinations_rejected() {
        let mut dir = InfiniteDirectory::new();
        assert!(matches!(
            dir.lookup(200, 0x40, MessageType::ReadReq),
            Err(CoherenceError::InvalidNode { node: 200 })
        ));
        assert!(dir.lookup(1, 0x40, MessageType::InvalidateAck).is_err());
        assert!(dir
            .process_request_response(1, MessageType::ReadReq, Some(MessageType::InvalidateAck), 0x40)
            .is_err());
        assert!(dir.process_snoop_response(1, MessageType::ReadReq, 0x40).is_ok(), "no entry, nothing to do");
    }

    #[test]
    fn test_failed_snoop_removes_sharer() {
        let mut dir = InfiniteDirectory::new();
        dir.insert_entry(0x40, SharingVector::from_nodes([1, 2])).unwrap();
        dir.process_snoop_response(1, MessageType::ReturnNAck, 0x40).unwrap();
        assert_eq!(dir.find(0x40).unwrap().sharers().to_list(), vec![2]);
    }

    #[test]
    fn test_outgoing_snoop_is_not_a_response() {
        let mut dir = InfiniteDirectory::new();
        dir.insert_entry(0x40, SharingVector::from_nodes([1, 2])).unwrap();
        assert!(matches!(
            dir.process_snoop_response(1, MessageType::Invalidate, 0x40),
            Err(CoherenceError::InvalidMessage {
                kind: MessageType::Invalidate,
                ..
            })
        ));
        assert_eq!(dir.find(0x40).unwrap().sharers().to_list(), vec![1, 2]);
    }
}
