// Protocol decision layer. The controller never hard-codes coherence decisions: each
// handler asks a Protocol for the rule matching (tile cache state, directory sharing
// state, message kind) and then carries the rule out. A rule names the Action (what gets
// sent and what happens to the miss-tracking entry), the cache state the line moves to
// once the transaction completes, and whether the data array has to be accessed. Actions
// are a tagged enum whose variants carry the message kinds they emit, and each variant
// has a Contract that finalize checks the transaction against.

//! Coherence protocol interface and actions.

pub mod table;

pub use table::MesiTableProtocol;

use std::fmt;

use crate::core::{CoherenceResult, MessageType};
use crate::directory::SharingState;

/// State of the line in this tile's shared cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum CacheState {
    #[default]
    Invalid,
    Shared,
    /// A private cache on this chip holds the line with write permission.
    Exclusive,
    Modified,
}

impl CacheState {
    pub const ALL: [CacheState; 4] = [
        CacheState::Invalid,
        CacheState::Shared,
        CacheState::Exclusive,
        CacheState::Modified,
    ];

    pub fn is_valid(self) -> bool {
        self != CacheState::Invalid
    }
}

/// What a resolved transaction does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Send snoops (or a writeback) and finish.
    Forward { snoop: MessageType },
    /// Send the reply; no miss-tracking entry is kept.
    Reply { reply: MessageType },
    /// Send the reply, then remove the miss-tracking entry and wake waiters.
    ReplyAndRemove { reply: MessageType },
    /// Send snoops and a notification; the reply follows once every ack is in.
    NotifyAndWaitAck { snoop: MessageType, reply: MessageType },
    /// Send snoops; the reply follows once every ack is in.
    ForwardAndWaitAck { snoop: MessageType, reply: MessageType },
    /// Send snoops and the reply; hold the line until every ack is in.
    ForwardAndReply { snoop: MessageType, reply: MessageType },
    /// Wake the entry that was waiting for this eviction.
    WakeEvictMAF,
    ForwardAndWakeEvictMAF { snoop: MessageType },
    NoAction,
    /// Defer: the request waits in the miss-tracking file.
    Stall,
    RemoveAndWake,
    RemoveOnly,
}

/// Miss-tracking operation performed by finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MafEffect {
    None,
    Remove,
    RemoveAndWake,
    WakeAfterEvict,
}

/// Outputs an action must produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contract {
    pub snoops: bool,
    pub reply: bool,
    pub maf: MafEffect,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Forward { .. } => "Forward",
            Action::Reply { .. } => "Reply",
            Action::ReplyAndRemove { .. } => "ReplyAndRemove",
            Action::NotifyAndWaitAck { .. } => "NotifyAndWaitAck",
            Action::ForwardAndWaitAck { .. } => "ForwardAndWaitAck",
            Action::ForwardAndReply { .. } => "ForwardAndReply",
            Action::WakeEvictMAF => "WakeEvictMAF",
            Action::ForwardAndWakeEvictMAF { .. } => "ForwardAndWakeEvictMAF",
            Action::NoAction => "NoAction",
            Action::Stall => "Stall",
            Action::RemoveAndWake => "RemoveAndWake",
            Action::RemoveOnly => "RemoveOnly",
        }
    }

    pub fn contract(&self) -> Contract {
        let (snoops, reply, maf) = match self {
            Action::Forward { .. } => (true, false, MafEffect::None),
            Action::Reply { .. } => (false, true, MafEffect::None),
            Action::ReplyAndRemove { .. } => (false, true, MafEffect::RemoveAndWake),
            Action::NotifyAndWaitAck { .. } => (true, true, MafEffect::None),
            Action::ForwardAndWaitAck { .. } => (true, false, MafEffect::None),
            Action::ForwardAndReply { .. } => (true, true, MafEffect::None),
            Action::WakeEvictMAF => (false, false, MafEffect::WakeAfterEvict),
            Action::ForwardAndWakeEvictMAF { .. } => (true, false, MafEffect::WakeAfterEvict),
            Action::NoAction | Action::Stall => (false, false, MafEffect::None),
            Action::RemoveAndWake => (false, false, MafEffect::RemoveAndWake),
            Action::RemoveOnly => (false, false, MafEffect::Remove),
        };
        Contract { snoops, reply, maf }
    }

    /// Snoop kind the action sends, if any.
    pub fn snoop_kind(&self) -> Option<MessageType> {
        match *self {
            Action::Forward { snoop }
            | Action::NotifyAndWaitAck { snoop, .. }
            | Action::ForwardAndWaitAck { snoop, .. }
            | Action::ForwardAndReply { snoop, .. }
            | Action::ForwardAndWakeEvictMAF { snoop } => Some(snoop),
            _ => None,
        }
    }

    /// Reply kind the requester eventually receives, if any.
    pub fn reply_kind(&self) -> Option<MessageType> {
        match *self {
            Action::Reply { reply }
            | Action::ReplyAndRemove { reply }
            | Action::NotifyAndWaitAck { reply, .. }
            | Action::ForwardAndWaitAck { reply, .. }
            | Action::ForwardAndReply { reply, .. } => Some(reply),
            _ => None,
        }
    }

    /// True for actions that leave the line locked until acks arrive.
    pub fn waits_for_acks(&self) -> bool {
        matches!(
            self,
            Action::NotifyAndWaitAck { .. }
                | Action::ForwardAndWaitAck { .. }
                | Action::ForwardAndReply { .. }
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A protocol rule: the action plus its side effects on the tile cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub action: Action,
    /// State the line moves to; `None` keeps the current state.
    pub next_state: Option<CacheState>,
    pub requires_data: bool,
}

impl Transition {
    pub const fn new(action: Action) -> Self {
        Self {
            action,
            next_state: None,
            requires_data: false,
        }
    }

    pub const fn next(mut self, state: CacheState) -> Self {
        self.next_state = Some(state);
        self
    }

    pub const fn with_data(mut self) -> Self {
        self.requires_data = true;
        self
    }
}

/// Coherence decision table.
pub trait Protocol {
    fn name(&self) -> &'static str;

    /// Full rule for the triple; fails with `PoisonAction` for impossible combinations.
    fn transition(
        &self,
        cache: CacheState,
        directory: SharingState,
        kind: MessageType,
    ) -> CoherenceResult<Transition>;

    fn get_action(
        &self,
        cache: CacheState,
        directory: SharingState,
        kind: MessageType,
    ) -> CoherenceResult<Action> {
        Ok(self.transition(cache, directory, kind)?.action)
    }

    /// Eviction message for replacing a line of the tile cache.
    fn evict(&self, tagset: u64, state: CacheState) -> Option<MessageType>;

    /// Worst-case snoops a single request can emit.
    fn max_snoops_per_request(&self) -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contracts() {
        let fwd = Action::ForwardAndWaitAck {
            snoop: MessageType::Invalidate,
            reply: MessageType::MissReplyWritable,
        };
        assert_eq!(
            fwd.contract(),
            Contract { snoops: true, reply: false, maf: MafEffect::None }
        );
        assert!(fwd.waits_for_acks());
        assert_eq!(fwd.reply_kind(), Some(MessageType::MissReplyWritable));

        let done = Action::ReplyAndRemove { reply: MessageType::MissReply };
        assert_eq!(done.contract().maf, MafEffect::RemoveAndWake);
        assert_eq!(done.snoop_kind(), None);
        assert_eq!(Action::RemoveOnly.contract().maf, MafEffect::Remove);
        assert_eq!(Action::Stall.to_string(), "Stall");
    }

    #[test]
    fn test_transition_builder() {
        let t = Transition::new(Action::NoAction).next(CacheState::Shared).with_data();
        assert_eq!(t.next_state, Some(CacheState::Shared));
        assert!(t.requires_data);
    }
}
