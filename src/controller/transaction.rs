//! In-flight transactions.
//!
//! A [`Transaction`] is created at admission with its worst-case claims and travels
//! through the MAF, tag and data stages. The resolve phase fills in the action and the
//! messages to send; finalize sends them and settles the receipts.

use std::fmt;

use crate::core::{Cycle, Message, ReceiptSet};
use crate::directory::EntryHandle;
use crate::protocol::Action;

use super::maf::MafHandle;

/// Admission class, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    /// Readmission of a woken MAF entry.
    WakeMAF,
    /// Drain of the tile-cache eviction buffer.
    CacheEvict,
    /// Back-invalidation of a directory victim.
    DirEvict,
    /// Snoop response from a private cache.
    Reply,
    /// Eviction notice from a private cache.
    Snoop,
    Request,
    /// Tile-cache replacement.
    IdleWork,
}

impl TransactionKind {
    pub fn name(self) -> &'static str {
        match self {
            TransactionKind::WakeMAF => "WakeMAF",
            TransactionKind::CacheEvict => "CacheEvict",
            TransactionKind::DirEvict => "DirEvict",
            TransactionKind::Reply => "Reply",
            TransactionKind::Snoop => "Snoop",
            TransactionKind::Request => "Request",
            TransactionKind::IdleWork => "IdleWork",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug)]
pub struct Transaction {
    pub id: u64,
    pub kind: TransactionKind,
    pub message: Message,
    pub action: Action,
    pub snoops: Vec<Message>,
    pub reply: Option<Message>,
    /// Request forwarded toward memory.
    pub forward: Option<Message>,
    pub receipts: ReceiptSet,
    pub maf: Option<MafHandle>,
    /// Directory pin released at finalize.
    pub entry: Option<EntryHandle>,
    /// Tag-stage slots the transaction occupies; zero skips the tag stage.
    pub lookups: u32,
    pub requires_data: bool,
    pub admitted_at: Cycle,
}

impl Transaction {
    pub fn new(id: u64, kind: TransactionKind, message: Message, now: Cycle) -> Self {
        Self {
            id,
            kind,
            message,
            action: Action::NoAction,
            snoops: Vec::new(),
            reply: None,
            forward: None,
            receipts: ReceiptSet::new(),
            maf: None,
            entry: None,
            lookups: 0,
            requires_data: false,
            admitted_at: now,
        }
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{} [{}] {} -> {}", self.id, self.kind, self.message, self.action)
    }
}
