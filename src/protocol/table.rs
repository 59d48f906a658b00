// Reference MESI-style decision table for a tile that homes lines in its shared cache
// and tracks private-cache sharers in the directory. The table is built once at
// construction into a hash map keyed by (cache state, sharing state, message kind);
// lookups never compute anything. Combinations that cannot happen in a consistent
// system are stored as explicit poison entries so that reaching one is reported as a
// protocol defect rather than silently picking a default. Snoop responses are accepted
// in every state because acks race with evictions; the ack bookkeeping itself lives in
// the controller.

//! Table-driven reference protocol.

use hashbrown::HashMap;

use crate::core::{CoherenceError, CoherenceResult, MessageType};
use crate::directory::SharingState;

use super::{Action, CacheState, Protocol, Transition};

type Key = (CacheState, SharingState, MessageType);

/// Precomputed decision table.
pub struct MesiTableProtocol {
    /// `None` marks a poison entry.
    rules: HashMap<Key, Option<Transition>>,
}

const READS: &[MessageType] = &[MessageType::ReadReq, MessageType::FetchReq];
const RESPONSES: &[MessageType] = &[
    MessageType::InvalidateAck,
    MessageType::InvUpdateAck,
    MessageType::DowngradeAck,
    MessageType::DownUpdateAck,
    MessageType::ReturnReply,
    MessageType::ReturnReplyDirty,
    MessageType::ReturnNAck,
];

const NOT_EXCLUSIVE: &[CacheState] = &[CacheState::Invalid, CacheState::Shared, CacheState::Modified];
const HOLDS_DATA: &[CacheState] = &[CacheState::Shared, CacheState::Modified];
const SHARED: &[SharingState] = &[SharingState::One, SharingState::Many];

impl MesiTableProtocol {
    pub fn new() -> Self {
        let mut table = Self {
            rules: HashMap::new(),
        };
        table.build();
        table
    }

    /// Number of (state, state, message) triples with a rule or poison entry.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn on(&mut self, caches: &[CacheState], dirs: &[SharingState], kinds: &[MessageType], t: Transition) {
        for &cache in caches {
            for &dir in dirs {
                for &kind in kinds {
                    self.rules.insert((cache, dir, kind), Some(t));
                }
            }
        }
    }

    fn poison(&mut self, caches: &[CacheState], dirs: &[SharingState], kinds: &[MessageType]) {
        for &cache in caches {
            for &dir in dirs {
                for &kind in kinds {
                    self.rules.insert((cache, dir, kind), None);
                }
            }
        }
    }

    fn build(&mut self) {
        use CacheState::*;
        use MessageType::*;
        use SharingState::{Many, One, Zero};

        // Reads.
        self.on(&[Invalid], &[Zero], READS,
            Transition::new(Action::Reply { reply: MissReply }).next(Shared).with_data());
        self.on(HOLDS_DATA, &[Zero], READS,
            Transition::new(Action::Reply { reply: MissReply }).with_data());
        self.on(HOLDS_DATA, SHARED, READS,
            Transition::new(Action::Reply { reply: MissReply }).with_data());
        self.on(&[Invalid], SHARED, READS,
            Transition::new(Action::ForwardAndWaitAck { snoop: ReturnReq, reply: MissReply })
                .next(Shared)
                .with_data());
        self.on(&[Exclusive], &[One], READS,
            Transition::new(Action::ForwardAndWaitAck { snoop: Downgrade, reply: MissReply })
                .next(Shared)
                .with_data());

        // Writes.
        self.on(NOT_EXCLUSIVE, &[Zero], &[WriteReq],
            Transition::new(Action::Reply { reply: MissReplyWritable }).next(Exclusive).with_data());
        self.on(NOT_EXCLUSIVE, SHARED, &[WriteReq],
            Transition::new(Action::ForwardAndWaitAck { snoop: Invalidate, reply: MissReplyWritable })
                .next(Exclusive)
                .with_data());
        self.on(&[Exclusive], &[One], &[WriteReq],
            Transition::new(Action::ForwardAndWaitAck { snoop: Invalidate, reply: MissReplyWritable })
                .next(Exclusive)
                .with_data());

        // Upgrades; a non-sharer's upgrade is rewritten to a write before lookup.
        self.poison(&CacheState::ALL, &[Zero], &[UpgradeReq]);
        self.on(NOT_EXCLUSIVE, &[One], &[UpgradeReq],
            Transition::new(Action::Reply { reply: UpgradeReply }).next(Exclusive));
        self.on(NOT_EXCLUSIVE, &[Many], &[UpgradeReq],
            Transition::new(Action::NotifyAndWaitAck { snoop: Invalidate, reply: UpgradeReply })
                .next(Exclusive));
        self.on(&[Exclusive], &[One], &[UpgradeReq],
            Transition::new(Action::Reply { reply: UpgradeReply }));

        // Non-allocating stores.
        self.on(&[Invalid], &[Zero], &[NonAllocatingStoreReq],
            Transition::new(Action::Reply { reply: NonAllocatingStoreReply }).with_data());
        self.on(HOLDS_DATA, &[Zero], &[NonAllocatingStoreReq],
            Transition::new(Action::Reply { reply: NonAllocatingStoreReply }).next(Modified).with_data());
        self.on(&[Invalid], SHARED, &[NonAllocatingStoreReq],
            Transition::new(Action::ForwardAndReply { snoop: Invalidate, reply: NonAllocatingStoreReply })
                .with_data());
        self.on(HOLDS_DATA, SHARED, &[NonAllocatingStoreReq],
            Transition::new(Action::ForwardAndReply { snoop: Invalidate, reply: NonAllocatingStoreReply })
                .next(Modified)
                .with_data());
        self.on(&[Exclusive], &[One], &[NonAllocatingStoreReq],
            Transition::new(Action::ForwardAndWaitAck { snoop: Invalidate, reply: NonAllocatingStoreReply })
                .next(Modified)
                .with_data());

        // Evictions from private caches.
        let evictions = [EvictClean, EvictWritable, EvictDirty];
        self.poison(&CacheState::ALL, &[Zero], &evictions);
        self.on(NOT_EXCLUSIVE, SHARED, &[EvictClean], Transition::new(Action::NoAction));
        self.on(&[Exclusive], &[One], &[EvictClean, EvictWritable],
            Transition::new(Action::NoAction).next(Shared));
        self.on(&[Invalid], &[One], &[EvictWritable], Transition::new(Action::NoAction));
        self.poison(HOLDS_DATA, &[One], &[EvictWritable, EvictDirty]);
        self.poison(NOT_EXCLUSIVE, &[Many], &[EvictWritable, EvictDirty]);
        self.on(&[Exclusive], &[One], &[EvictDirty],
            Transition::new(Action::NoAction).next(Modified).with_data());
        self.on(&[Invalid], &[One], &[EvictDirty],
            Transition::new(Action::Forward { snoop: EvictDirty }));

        // An exclusive owner is always the only sharer.
        let every_request = [ReadReq, FetchReq, WriteReq, UpgradeReq, NonAllocatingStoreReq];
        self.poison(&[Exclusive], &[Zero, Many], &every_request);
        self.poison(&[Exclusive], &[Zero, Many], &evictions);

        // Snoop responses.
        for &kind in RESPONSES {
            let t = if kind.carries_dirty_data() {
                Transition::new(Action::NoAction).with_data()
            } else {
                Transition::new(Action::NoAction)
            };
            self.on(&CacheState::ALL, &SharingState::ALL, &[kind], t);
        }
    }
}

impl Default for MesiTableProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for MesiTableProtocol {
    fn name(&self) -> &'static str {
        "MesiTableProtocol"
    }

    fn transition(
        &self,
        cache: CacheState,
        directory: SharingState,
        kind: MessageType,
    ) -> CoherenceResult<Transition> {
        match self.rules.get(&(cache, directory, kind)) {
            Some(Some(t)) => Ok(*t),
            Some(None) | None => Err(CoherenceError::PoisonAction {
                cache,
                directory,
                message: kind,
            }),
        }
    }

    fn evict(&self, _tagset: u64, state: CacheState) -> Option<MessageType> {
        match state {
            CacheState::Invalid => None,
            CacheState::Shared => Some(MessageType::EvictClean),
            CacheState::Exclusive => Some(MessageType::EvictWritable),
            CacheState::Modified => Some(MessageType::EvictDirty),
        }
    }

    fn max_snoops_per_request(&self) -> u32 {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proto() -> MesiTableProtocol {
        MesiTableProtocol::new()
    }

    #[test]
    fn test_read_on_empty_directory_replies() {
        let t = proto()
            .transition(CacheState::Invalid, SharingState::Zero, MessageType::ReadReq)
            .unwrap();
        assert_eq!(t.action, Action::Reply { reply: MessageType::MissReply });
        assert_eq!(t.next_state, Some(CacheState::Shared));
        assert!(t.requires_data);
    }

    #[test]
    fn test_write_with_sharers_invalidates() {
        let action = proto()
            .get_action(CacheState::Shared, SharingState::One, MessageType::WriteReq)
            .unwrap();
        assert_eq!(
            action,
            Action::ForwardAndWaitAck {
                snoop: MessageType::Invalidate,
                reply: MessageType::MissReplyWritable
            }
        );
    }

    #[test]
    fn test_upgrade_many_notifies() {
        let action = proto()
            .get_action(CacheState::Shared, SharingState::Many, MessageType::UpgradeReq)
            .unwrap();
        assert!(matches!(action, Action::NotifyAndWaitAck { .. }));
    }

    #[test]
    fn test_poison_entries() {
        let p = proto();
        for (cache, dir, kind) in [
            (CacheState::Shared, SharingState::Zero, MessageType::UpgradeReq),
            (CacheState::Shared, SharingState::Zero, MessageType::EvictClean),
            (CacheState::Shared, SharingState::Many, MessageType::EvictWritable),
            (CacheState::Exclusive, SharingState::Many, MessageType::ReadReq),
            (CacheState::Modified, SharingState::One, MessageType::EvictDirty),
        ] {
            let err = p.transition(cache, dir, kind).unwrap_err();
            assert!(matches!(err, CoherenceError::PoisonAction { .. }), "{cache:?} {dir:?} {kind:?}");
        }
        // Outgoing-only kinds never reach the table.
        assert!(p.get_action(CacheState::Shared, SharingState::One, MessageType::MissReply).is_err());
    }

    #[test]
    fn test_every_request_triple_is_covered() {
        let p = proto();
        for cache in CacheState::ALL {
            for dir in SharingState::ALL {
                for kind in MessageType::ALL {
                    if kind.is_request() || kind.is_eviction() || kind.is_snoop_response() {
                        assert!(
                            p.rules.contains_key(&(cache, dir, kind)),
                            "missing rule for {cache:?} {dir:?} {kind:?}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_responses_accepted_in_any_state() {
        let p = proto();
        for cache in CacheState::ALL {
            for dir in SharingState::ALL {
                assert_eq!(
                    p.get_action(cache, dir, MessageType::InvalidateAck).unwrap(),
                    Action::NoAction
                );
            }
        }
        assert!(p
            .transition(CacheState::Shared, SharingState::One, MessageType::InvUpdateAck)
            .unwrap()
            .requires_data);
    }

    #[test]
    fn test_evict_messages() {
        let p = proto();
        assert_eq!(p.evict(0, CacheState::Invalid), None);
        assert_eq!(p.evict(0, CacheState::Modified), Some(MessageType::EvictDirty));
        assert_eq!(p.evict(0, CacheState::Exclusive), Some(MessageType::EvictWritable));
        assert_eq!(p.evict(0, CacheState::Shared), Some(MessageType::EvictClean));
        assert_eq!(p.max_snoops_per_request(), 2);
    }
}
