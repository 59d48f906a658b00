// Coherence messages exchanged between the directory controller and the rest of the
// system. A Message names the line address, the message kind, the node whose request the
// message belongs to, the sender and the destination (a single node, a multicast set of
// nodes, or the memory side). The payload is opaque to the controller and is only carried
// through. MessageType is a flat enum grouped into requests, outgoing snoops, snoop
// responses, replies and evictions; the classification helpers are what the handlers use
// to reject messages that arrived on the wrong channel.

//! Coherence message definitions.

use crate::directory::SharingVector;
use std::fmt;

/// Line address. Callers pass block-aligned addresses.
pub type Address = u64;

/// Node (tile or private cache) identifier.
pub type NodeId = u16;

/// Simulation time in controller ticks.
pub type Cycle = u64;

/// Every message kind the controller consumes or produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageType {
    // Requests from private caches.
    ReadReq,
    FetchReq,
    WriteReq,
    UpgradeReq,
    NonAllocatingStoreReq,

    // Snoops sent to private caches.
    Invalidate,
    Downgrade,
    ReturnReq,

    // Snoop responses.
    InvalidateAck,
    InvUpdateAck,
    DowngradeAck,
    DownUpdateAck,
    ReturnReply,
    ReturnReplyDirty,
    ReturnNAck,

    // Replies to requesters.
    MissReply,
    MissReplyWritable,
    MissReplyDirty,
    UpgradeReply,
    MissNotify,
    NonAllocatingStoreReply,

    // Evictions from private caches or the tile cache.
    EvictClean,
    EvictWritable,
    EvictDirty,
}

impl MessageType {
    pub const ALL: [MessageType; 24] = [
        MessageType::ReadReq,
        MessageType::FetchReq,
        MessageType::WriteReq,
        MessageType::UpgradeReq,
        MessageType::NonAllocatingStoreReq,
        MessageType::Invalidate,
        MessageType::Downgrade,
        MessageType::ReturnReq,
        MessageType::InvalidateAck,
        MessageType::InvUpdateAck,
        MessageType::DowngradeAck,
        MessageType::DownUpdateAck,
        MessageType::ReturnReply,
        MessageType::ReturnReplyDirty,
        MessageType::ReturnNAck,
        MessageType::MissReply,
        MessageType::MissReplyWritable,
        MessageType::MissReplyDirty,
        MessageType::UpgradeReply,
        MessageType::MissNotify,
        MessageType::NonAllocatingStoreReply,
        MessageType::EvictClean,
        MessageType::EvictWritable,
        MessageType::EvictDirty,
    ];

    pub fn is_request(self) -> bool {
        matches!(
            self,
            MessageType::ReadReq
                | MessageType::FetchReq
                | MessageType::WriteReq
                | MessageType::UpgradeReq
                | MessageType::NonAllocatingStoreReq
        )
    }

    pub fn is_snoop(self) -> bool {
        matches!(
            self,
            MessageType::Invalidate | MessageType::Downgrade | MessageType::ReturnReq
        )
    }

    pub fn is_snoop_response(self) -> bool {
        matches!(
            self,
            MessageType::InvalidateAck
                | MessageType::InvUpdateAck
                | MessageType::DowngradeAck
                | MessageType::DownUpdateAck
                | MessageType::ReturnReply
                | MessageType::ReturnReplyDirty
                | MessageType::ReturnNAck
        )
    }

    pub fn is_reply(self) -> bool {
        matches!(
            self,
            MessageType::MissReply
                | MessageType::MissReplyWritable
                | MessageType::MissReplyDirty
                | MessageType::UpgradeReply
                | MessageType::MissNotify
                | MessageType::NonAllocatingStoreReply
        )
    }

    pub fn is_eviction(self) -> bool {
        matches!(
            self,
            MessageType::EvictClean | MessageType::EvictWritable | MessageType::EvictDirty
        )
    }

    /// Responses that hand modified data back to the tile.
    pub fn carries_dirty_data(self) -> bool {
        matches!(
            self,
            MessageType::InvUpdateAck
                | MessageType::DownUpdateAck
                | MessageType::ReturnReplyDirty
                | MessageType::EvictDirty
        )
    }

    /// The response a private cache sends back for a snoop of this kind.
    pub fn snoop_ack(self, dirty: bool) -> Option<MessageType> {
        match (self, dirty) {
            (MessageType::Invalidate, false) => Some(MessageType::InvalidateAck),
            (MessageType::Invalidate, true) => Some(MessageType::InvUpdateAck),
            (MessageType::Downgrade, false) => Some(MessageType::DowngradeAck),
            (MessageType::Downgrade, true) => Some(MessageType::DownUpdateAck),
            (MessageType::ReturnReq, false) => Some(MessageType::ReturnReply),
            (MessageType::ReturnReq, true) => Some(MessageType::ReturnReplyDirty),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Where an outgoing message is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Node(NodeId),
    Multicast(SharingVector),
    Memory,
}

impl Destination {
    /// Number of nodes that will see the message.
    pub fn fan_out(&self) -> u32 {
        match self {
            Destination::Node(_) | Destination::Memory => 1,
            Destination::Multicast(set) => set.count(),
        }
    }
}

/// A coherence message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub address: Address,
    pub kind: MessageType,
    /// Node whose request this message serves.
    pub requester: NodeId,
    pub source: NodeId,
    pub destination: Destination,
    /// Acks the receiver should expect before the transaction completes.
    pub outstanding: u32,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageType, address: Address, source: NodeId, destination: Destination) -> Self {
        Self {
            address,
            kind,
            requester: source,
            source,
            destination,
            outstanding: 0,
            payload: Vec::new(),
        }
    }

    /// A request issued by `node`, addressed to the tile `home`.
    pub fn request(kind: MessageType, address: Address, node: NodeId, home: NodeId) -> Self {
        Self::new(kind, address, node, Destination::Node(home))
    }

    /// A message produced by the tile on behalf of `requester`.
    pub fn derived(&self, kind: MessageType, source: NodeId, destination: Destination) -> Self {
        Self {
            address: self.address,
            kind,
            requester: self.requester,
            source,
            destination,
            outstanding: 0,
            payload: Vec::new(),
        }
    }

    pub fn with_requester(mut self, requester: NodeId) -> Self {
        self.requester = requester;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} addr={:#x} src={} req={} dst={:?}",
            self.kind, self.address, self.source, self.requester, self.destination
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_is_disjoint() {
        for kind in MessageType::ALL {
            let classes = [
                kind.is_request(),
                kind.is_snoop(),
                kind.is_snoop_response(),
                kind.is_reply(),
                kind.is_eviction(),
            ];
            assert_eq!(classes.iter().filter(|c| **c).count(), 1, "{kind}");
        }
    }

    #[test]
    fn test_snoop_ack_kinds() {
        assert_eq!(MessageType::Invalidate.snoop_ack(false), Some(MessageType::InvalidateAck));
        assert_eq!(MessageType::Downgrade.snoop_ack(true), Some(MessageType::DownUpdateAck));
        assert_eq!(MessageType::ReadReq.snoop_ack(false), None);
        assert!(MessageType::ReturnReplyDirty.carries_dirty_data());
    }

    #[test]
    fn test_derived_keeps_requester() {
        let req = Message::request(MessageType::WriteReq, 0x40, 5, 0);
        let snoop = req.derived(MessageType::Invalidate, 0, Destination::Node(3));
        assert_eq!(snoop.requester, 5);
        assert_eq!(snoop.source, 0);
        assert_eq!(snoop.address, 0x40);
    }
}
