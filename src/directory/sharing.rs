//! Sharer tracking.
//!
//! A [`SharingVector`] is a fixed-width bitset of node ids, one bit per node, copied by
//! value wherever a lookup hands sharer information out. [`SharingState`] is the coarse
//! summary the protocol table is keyed on.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::NodeId;

/// Maximum number of nodes a sharing vector can track.
pub const MAX_NUM_SHARERS: usize = 128;

/// Coarse sharer count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SharingState {
    Zero,
    One,
    Many,
}

impl SharingState {
    pub const ALL: [SharingState; 3] = [SharingState::Zero, SharingState::One, SharingState::Many];

    pub fn from_count(count: u32) -> Self {
        match count {
            0 => SharingState::Zero,
            1 => SharingState::One,
            _ => SharingState::Many,
        }
    }
}

/// Bit set of sharer node ids.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SharingVector {
    bits: u128,
}

impl SharingVector {
    pub const fn new() -> Self {
        Self { bits: 0 }
    }

    pub const fn from_bits(bits: u128) -> Self {
        Self { bits }
    }

    pub fn bits(&self) -> u128 {
        self.bits
    }

    /// Build a vector from a list of node ids; ids out of range are ignored.
    pub fn from_nodes(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        let mut set = Self::new();
        for node in nodes {
            set.add(node);
        }
        set
    }

    pub fn contains(&self, node: NodeId) -> bool {
        (node as usize) < MAX_NUM_SHARERS && (self.bits >> node) & 1 != 0
    }

    pub fn add(&mut self, node: NodeId) {
        if (node as usize) < MAX_NUM_SHARERS {
            self.bits |= 1u128 << node;
        }
    }

    pub fn remove(&mut self, node: NodeId) {
        if (node as usize) < MAX_NUM_SHARERS {
            self.bits &= !(1u128 << node);
        }
    }

    pub fn clear(&mut self) {
        self.bits = 0;
    }

    pub fn count(&self) -> u32 {
        self.bits.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn state(&self) -> SharingState {
        SharingState::from_count(self.count())
    }

    /// Lowest-numbered sharer.
    pub fn first(&self) -> Option<NodeId> {
        (self.bits != 0).then(|| self.bits.trailing_zeros() as NodeId)
    }

    /// Sharer nearest to `node`, not counting `node` itself unless it is the only one.
    /// Ties go to the higher id.
    pub fn closest(&self, node: NodeId) -> Option<NodeId> {
        let index = node as usize;
        let above = (index + 1..MAX_NUM_SHARERS).find(|i| (self.bits >> i) & 1 != 0);
        let below = (0..index.min(MAX_NUM_SHARERS)).rev().find(|i| (self.bits >> i) & 1 != 0);
        let pick = match (below, above) {
            (Some(lo), Some(hi)) => {
                if index - lo < hi - index {
                    lo
                } else {
                    hi
                }
            }
            (Some(lo), None) => lo,
            (None, Some(hi)) => hi,
            (None, None) => return self.contains(node).then_some(node),
        };
        Some(pick as NodeId)
    }

    pub fn union(&mut self, other: &SharingVector) {
        self.bits |= other.bits;
    }

    pub fn intersect(&mut self, other: &SharingVector) {
        self.bits &= other.bits;
    }

    /// Copy of this set with `node` removed.
    pub fn without(&self, node: NodeId) -> SharingVector {
        let mut set = *self;
        set.remove(node);
        set
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..MAX_NUM_SHARERS)
            .filter(move |i| (self.bits >> i) & 1 != 0)
            .map(|i| i as NodeId)
    }

    pub fn to_list(&self) -> Vec<NodeId> {
        self.iter().collect()
    }
}

impl fmt::Debug for SharingVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
