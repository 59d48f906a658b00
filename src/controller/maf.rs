// Miss address file. Every transaction that has to outlive its pass through the
// pipeline leaves an entry here: requests waiting for snoop acks, requests deferred
// behind an earlier transaction for the same line, requests waiting for an eviction to
// drain, and requests that could not get a directory way. The controller reaches the
// file only through the MissTracker trait. Entries are kept in arrival order so waking
// is first-come first-served, and the file does its own capacity accounting with a
// reservation count so admission can claim a slot before the entry exists.

//! Miss address file (MAF).

use std::collections::BTreeMap;
use std::fmt;

use crate::core::{Address, CoherenceError, CoherenceResult, Message, NodeId};
use crate::directory::{EntryHandle, SharingVector};
use crate::protocol::CacheState;

/// Identifies a MAF entry. Handles are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MafHandle(u64);

impl MafHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MafHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "maf#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MafState {
    /// No directory way was available.
    WaitSet,
    /// Deferred behind another transaction for the same line.
    WaitRequest,
    /// Waiting for an eviction of the line to complete.
    WaitEvict,
    /// Waiting for snoop acks.
    WaitAck,
    /// Woken, waiting to be readmitted.
    Waking,
    /// Readmitted and travelling through the pipeline.
    InPipeline,
    /// Reply decided; removed when the transaction finalizes.
    Finishing,
}

impl MafState {
    /// States that own the line until they are removed.
    pub fn is_active(self) -> bool {
        matches!(self, MafState::WaitAck | MafState::Finishing)
    }
}

#[derive(Debug, Clone)]
pub struct MafEntry {
    pub request: Message,
    pub state: MafState,
    /// Nodes whose snoop responses are still outstanding.
    pub awaiting: SharingVector,
    /// Reply to send once the last ack arrives.
    pub pending_reply: Option<Message>,
    pub reply_requires_data: bool,
    /// Tile cache state to apply on completion.
    pub next_state: Option<CacheState>,
    /// Directory pin held while the entry lives.
    pub pin: Option<EntryHandle>,
}

impl MafEntry {
    pub fn new(request: Message, state: MafState) -> Self {
        Self {
            request,
            state,
            awaiting: SharingVector::new(),
            pending_reply: None,
            reply_requires_data: false,
            next_state: None,
            pin: None,
        }
    }

    pub fn address(&self) -> Address {
        self.request.address
    }
}

/// Interface the controller uses to track outstanding misses.
pub trait MissTracker {
    fn capacity(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when entries plus reservations fill the file.
    fn full(&self) -> bool;

    fn has_space(&self, n: usize) -> bool;

    fn reserve(&mut self) -> CoherenceResult<()>;

    fn unreserve(&mut self) -> CoherenceResult<()>;

    fn insert(&mut self, entry: MafEntry) -> CoherenceResult<MafHandle>;

    fn get(&self, handle: MafHandle) -> Option<&MafEntry>;

    fn get_mut(&mut self, handle: MafHandle) -> Option<&mut MafEntry>;

    fn set_state(&mut self, handle: MafHandle, state: MafState) -> CoherenceResult<()>;

    fn remove(&mut self, handle: MafHandle) -> CoherenceResult<MafEntry>;

    /// Entries for `address`, oldest first.
    fn entries_for(&self, address: Address) -> Vec<(MafHandle, &MafEntry)>;

    fn has_waking_entry(&self) -> bool;

    /// Oldest woken entry, if any.
    fn peek_waking(&self) -> Option<(MafHandle, &MafEntry)>;

    /// Claim the oldest woken entry for readmission.
    fn take_waking(&mut self) -> Option<MafHandle>;

    /// Entry that currently owns `address` (waiting for acks or finishing).
    fn find_active(&self, address: Address) -> Option<MafHandle> {
        self.entries_for(address)
            .into_iter()
            .find(|(_, entry)| entry.state.is_active())
            .map(|(handle, _)| handle)
    }

    /// Entry waiting for an ack from `node` on `address`.
    fn find_awaiting(&self, address: Address, node: NodeId) -> Option<MafHandle>;

    /// Entry for `address` waiting on an eviction, optionally one issued by `node`.
    fn find_waiting_on_evict(&self, address: Address, node: Option<NodeId>) -> Option<MafHandle>;

    /// Note an ack from `node`; returns how many acks are still outstanding.
    fn record_ack(&mut self, handle: MafHandle, node: NodeId) -> CoherenceResult<u32>;

    fn wake_after_evict(&mut self, handle: MafHandle) -> CoherenceResult<()>;

    /// Wake the oldest request deferred behind `address`, if the line is free.
    fn wake_waiters(&mut self, address: Address) -> usize;

    /// Wake the oldest request waiting for a directory way.
    fn wake_set_waiter(&mut self) -> usize;

    fn has_other_entries(&self, address: Address, except: MafHandle) -> bool {
        self.entries_for(address).iter().any(|(h, _)| *h != except)
    }

    /// One line per entry, for stall diagnostics.
    fn dump(&self) -> Vec<String>;
}

/// Reference MAF implementation.
pub struct MissAddressFile {
    name: String,
    capacity: usize,
    reserved: usize,
    next_id: u64,
    entries: BTreeMap<MafHandle, MafEntry>,
}

impl MissAddressFile {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            reserved: 0,
            next_id: 0,
            entries: BTreeMap::new(),
        }
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    fn violation(&self, operation: &'static str) -> CoherenceError {
        CoherenceError::CapacityInvariant {
            queue: self.name.clone(),
            operation,
            used: self.entries.len(),
            reserved: self.entries.len() + self.reserved,
            capacity: self.capacity,
        }
    }

    fn entry_mut(&mut self, handle: MafHandle) -> CoherenceResult<&mut MafEntry> {
        self.entries
            .get_mut(&handle)
            .ok_or(CoherenceError::UnknownMafEntry(handle.0))
    }
}

impl MissTracker for MissAddressFile {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn full(&self) -> bool {
        self.entries.len() + self.reserved >= self.capacity
    }

    fn has_space(&self, n: usize) -> bool {
        self.entries.len() + self.reserved + n <= self.capacity
    }

    fn reserve(&mut self) -> CoherenceResult<()> {
        if self.full() {
            return Err(self.violation("reserve"));
        }
        self.reserved += 1;
        Ok(())
    }

    fn unreserve(&mut self) -> CoherenceResult<()> {
        if self.reserved == 0 {
            return Err(self.violation("unreserve"));
        }
        self.reserved -= 1;
        Ok(())
    }

    fn insert(&mut self, entry: MafEntry) -> CoherenceResult<MafHandle> {
        if self.full() {
            return Err(self.violation("insert"));
        }
        let handle = MafHandle(self.next_id);
        self.next_id += 1;
        log::trace!(
            "{}: insert {} {:?} for {}",
            self.name,
            handle,
            entry.state,
            entry.request
        );
        self.entries.insert(handle, entry);
        Ok(handle)
    }

    fn get(&self, handle: MafHandle) -> Option<&MafEntry> {
        self.entries.get(&handle)
    }

    fn get_mut(&mut self, handle: MafHandle) -> Option<&mut MafEntry> {
        self.entries.get_mut(&handle)
    }

    fn set_state(&mut self, handle: MafHandle, state: MafState) -> CoherenceResult<()> {
        self.entry_mut(handle)?.state = state;
        Ok(())
    }

    fn remove(&mut self, handle: MafHandle) -> CoherenceResult<MafEntry> {
        self.entries
            .remove(&handle)
            .ok_or(CoherenceError::UnknownMafEntry(handle.0))
    }

    fn entries_for(&self, address: Address) -> Vec<(MafHandle, &MafEntry)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.address() == address)
            .map(|(h, e)| (*h, e))
            .collect()
    }

    fn has_waking_entry(&self) -> bool {
        self.entries.values().any(|e| e.state == MafState::Waking)
    }

    fn peek_waking(&self) -> Option<(MafHandle, &MafEntry)> {
        self.entries
            .iter()
            .find(|(_, e)| e.state == MafState::Waking)
            .map(|(h, e)| (*h, e))
    }

    fn take_waking(&mut self) -> Option<MafHandle> {
        let (handle, entry) = self
            .entries
            .iter_mut()
            .find(|(_, e)| e.state == MafState::Waking)?;
        entry.state = MafState::InPipeline;
        Some(*handle)
    }

    fn find_awaiting(&self, address: Address, node: NodeId) -> Option<MafHandle> {
        self.entries
            .iter()
            .find(|(_, e)| {
                e.address() == address && e.state == MafState::WaitAck && e.awaiting.contains(node)
            })
            .map(|(h, _)| *h)
    }

    fn find_waiting_on_evict(&self, address: Address, node: Option<NodeId>) -> Option<MafHandle> {
        self.entries
            .iter()
            .find(|(_, e)| {
                e.address() == address
                    && e.state == MafState::WaitEvict
                    && node.is_none_or(|n| e.request.requester == n)
            })
            .map(|(h, _)| *h)
    }

    fn record_ack(&mut self, handle: MafHandle, node: NodeId) -> CoherenceResult<u32> {
        let entry = self.entry_mut(handle)?;
        entry.awaiting.remove(node);
        Ok(entry.awaiting.count())
    }

    fn wake_after_evict(&mut self, handle: MafHandle) -> CoherenceResult<()> {
        let entry = self.entry_mut(handle)?;
        if entry.state == MafState::WaitEvict {
            entry.state = MafState::Waking;
        }
        Ok(())
    }

    fn wake_waiters(&mut self, address: Address) -> usize {
        let busy = self.entries.values().any(|e| {
            e.address() == address
                && !matches!(e.state, MafState::WaitRequest | MafState::WaitSet)
        });
        if busy {
            return 0;
        }
        match self
            .entries
            .values_mut()
            .find(|e| e.address() == address && e.state == MafState::WaitRequest)
        {
            Some(entry) => {
                entry.state = MafState::Waking;
                1
            }
            None => 0,
        }
    }

    fn wake_set_waiter(&mut self) -> usize {
        match self
            .entries
            .values_mut()
            .find(|e| e.state == MafState::WaitSet)
        {
            Some(entry) => {
                entry.state = MafState::Waking;
                1
            }
            None => 0,
        }
    }

    fn dump(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(h, e)| format!("{} {:?} awaiting={:?} {}", h, e.state, e.awaiting, e.request))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MessageType;

    fn req(addr: Address, node: NodeId) -> Message {
        Message::request(MessageType::ReadReq, addr, node, 0)
    }

    #[test]
    fn test_reservation_accounting() {
        let mut maf = MissAddressFile::new("maf", 2);
        maf.reserve().unwrap();
        maf.reserve().unwrap();
        assert!(maf.full());
        assert!(maf.reserve().is_err());
        maf.unreserve().unwrap();
        maf.insert(MafEntry::new(req(0x40, 1), MafState::WaitAck)).unwrap();
        assert!(maf.full());
        assert!(maf.insert(MafEntry::new(req(0x80, 1), MafState::WaitAck)).is_err());
        maf.unreserve().unwrap();
        assert!(maf.unreserve().is_err());
    }

    #[test]
    fn test_waking_is_first_come_first_served() {
        let mut maf = MissAddressFile::new("maf", 8);
        let a = maf.insert(MafEntry::new(req(0x40, 1), MafState::WaitSet)).unwrap();
        let b = maf.insert(MafEntry::new(req(0x80, 2), MafState::WaitSet)).unwrap();
        assert!(!maf.has_waking_entry());
        assert_eq!(maf.wake_set_waiter(), 1);
        assert_eq!(maf.wake_set_waiter(), 1);
        assert_eq!(maf.peek_waking().map(|(h, _)| h), Some(a));
        assert_eq!(maf.take_waking(), Some(a));
        assert_eq!(maf.get(a).unwrap().state, MafState::InPipeline);
        assert_eq!(maf.take_waking(), Some(b));
        assert_eq!(maf.take_waking(), None);
    }

    #[test]
    fn test_wake_waiters_waits_for_active_entry() {
        let mut maf = MissAddressFile::new("maf", 8);
        let active = maf.insert(MafEntry::new(req(0x40, 1), MafState::WaitAck)).unwrap();
        let first = maf.insert(MafEntry::new(req(0x40, 2), MafState::WaitRequest)).unwrap();
        let second = maf.insert(MafEntry::new(req(0x40, 3), MafState::WaitRequest)).unwrap();
        assert_eq!(maf.wake_waiters(0x40), 0);
        assert_eq!(maf.find_active(0x40), Some(active));
        maf.remove(active).unwrap();
        assert_eq!(maf.find_active(0x40), None);
        assert_eq!(maf.wake_waiters(0x40), 1);
        assert_eq!(maf.get(first).unwrap().state, MafState::Waking);
        assert_eq!(maf.get(second).unwrap().state, MafState::WaitRequest);
        // Only one waiter per line is woken at a time.
        assert_eq!(maf.wake_waiters(0x40), 0);
        assert!(maf.has_other_entries(0x40, first));
    }

    #[test]
    fn test_ack_tracking() {
        let mut maf = MissAddressFile::new("maf", 4);
        let mut entry = MafEntry::new(req(0x40, 5), MafState::WaitAck);
        entry.awaiting = SharingVector::from_nodes([1, 2]);
        let h = maf.insert(entry).unwrap();
        assert_eq!(maf.find_awaiting(0x40, 2), Some(h));
        assert_eq!(maf.find_awaiting(0x40, 3), None);
        assert_eq!(maf.record_ack(h, 2).unwrap(), 1);
        assert_eq!(maf.find_awaiting(0x40, 2), None);
        assert_eq!(maf.record_ack(h, 1).unwrap(), 0);
        assert!(matches!(
            maf.record_ack(MafHandle(99), 1),
            Err(CoherenceError::UnknownMafEntry(99))
        ));
    }

    #[test]
    fn test_evict_waiters() {
        let mut maf = MissAddressFile::new("maf", 4);
        let h = maf.insert(MafEntry::new(req(0x40, 3), MafState::WaitEvict)).unwrap();
        assert_eq!(maf.find_waiting_on_evict(0x40, Some(3)), Some(h));
        assert_eq!(maf.find_waiting_on_evict(0x40, Some(4)), None);
        assert_eq!(maf.find_waiting_on_evict(0x40, None), Some(h));
        maf.wake_after_evict(h).unwrap();
        assert_eq!(maf.get(h).unwrap().state, MafState::Waking);
        assert_eq!(maf.dump().len(), 1);
    }
}
