// This module defines the error types for the coherence controller using the thiserror
// crate. CoherenceError is the single error enum every fallible operation returns. Its
// variants split into two families: invariant violations that indicate a defect in the
// controller or its collaborators (capacity invariant, reservation imbalance, obligations
// left at finalize, busy pipeline servers, poison protocol actions, malformed messages)
// and boundary failures (snapshot encoding, I/O, configuration). Backpressure is never
// reported through this type; admission failures are ordinary control flow. The module
// also provides CoherenceResult<T> as the crate-wide Result alias.

//! Error types for the coherence controller.

use thiserror::Error;

use super::message::{Address, MessageType, NodeId};
use super::reservation::Resource;
use crate::directory::SharingState;
use crate::protocol::CacheState;

/// Main error type for the directory controller.
#[derive(Error, Debug)]
pub enum CoherenceError {
    #[error("{queue}: capacity invariant violated by {operation} (used {used}, reserved {reserved}, capacity {capacity})")]
    CapacityInvariant {
        queue: String,
        operation: &'static str,
        used: usize,
        reserved: usize,
        capacity: usize,
    },

    #[error("{stage}: no free server at cycle {now}")]
    PipelineBusy { stage: String, now: u64 },

    #[error("Poison action: cache {cache:?}, directory {directory:?}, message {message:?}")]
    PoisonAction {
        cache: CacheState,
        directory: SharingState,
        message: MessageType,
    },

    #[error("Reservation imbalance on {resource:?}: {requested} requested, {held} held")]
    ReservationImbalance {
        resource: Resource,
        held: u32,
        requested: u32,
    },

    #[error("Transaction {id} finalized with undischarged obligations: {detail}")]
    UndischargedObligation { id: u64, detail: String },

    #[error("Message {kind:?} is not valid for {operation}")]
    InvalidMessage {
        kind: MessageType,
        operation: &'static str,
    },

    #[error("Node {node} is not a sharer of {address:#x}")]
    NotASharer { node: NodeId, address: Address },

    #[error("No directory entry for {address:#x}")]
    MissingEntry { address: Address },

    #[error("Node id {node} out of range")]
    InvalidNode { node: NodeId },

    #[error("MAF entry {0} not found")]
    UnknownMafEntry(u64),

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Snapshot encoding failed: {0}")]
    Snapshot(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for controller operations.
pub type CoherenceResult<T> = Result<T, CoherenceError>;
