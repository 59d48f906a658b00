// This module collects the building blocks the directory controller is made of and that
// do not depend on any coherence policy: the crate-wide error type, message definitions,
// bounded channels with a reservation counter, timed pipeline stages with a pool of
// servers, per-transaction reservation receipts, and the controller statistics.

//! Core controller infrastructure.
//!
//! # Key Components
//!
//! ## Channels (`reserved_queue`)
//! - Bounded FIFO with a separate reservation count
//! - `used <= reserved <= capacity` checked on every operation
//!
//! ## Pipeline stages (`pipeline`)
//! - Fixed number of servers, issue latency and completion latency
//! - Items leave in admission order
//!
//! ## Reservations (`reservation`)
//! - Claims a transaction holds against each bounded resource
//! - Released, refunded or transferred into occupancy, never leaked
//!
//! ## Messages (`message`) and statistics (`stats`)

pub mod error;
pub mod message;
pub mod pipeline;
pub mod reservation;
pub mod reserved_queue;
pub mod stats;

pub use error::{CoherenceError, CoherenceResult};
pub use message::{Address, Cycle, Destination, Message, MessageType, NodeId};
pub use pipeline::{StageTiming, TimedPipelineStage};
pub use reservation::{ReceiptSet, ReservationReceipt, Resource};
pub use reserved_queue::{Channel, ReservedQueue};
pub use stats::ControllerStats;
