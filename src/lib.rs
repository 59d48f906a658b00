//! cmpdir - per-tile cache-coherence directory controller.
//!
//! A tile of a chip multiprocessor homes a slice of the address space in its shared
//! cache and keeps a directory of which private caches hold each line. The
//! [`CacheCoherenceController`] accepts requests, eviction notices and snoop responses
//! on bounded channels, consults a [`Protocol`] decision table and emits snoops,
//! replies and memory requests, one [`tick`](CacheCoherenceController::tick) at a time.
//!
//! # Primary Usage
//!
//! ```no_run
//! use cmpdir::{CacheCoherenceController, ControllerConfig, Loopback, MessageType};
//!
//! let mut ctrl = CacheCoherenceController::new(ControllerConfig::default())?;
//! let mut net = Loopback::new(0, 4);
//! net.issue(&mut ctrl, 3, MessageType::ReadReq, 0x1000)?;
//! net.run_until_quiesced(&mut ctrl, 1_000)?;
//! println!("{}", ctrl.stats());
//! # Ok::<(), cmpdir::CoherenceError>(())
//! ```
//!
//! # Architecture
//!
//! - [`core`] - channels, pipeline stages, reservations, messages, errors
//! - [`directory`] - sharer tracking (unbounded and set-associative) and snapshots
//! - [`protocol`] - decision table interface and the reference MESI table
//! - [`controller`] - the three-phase controller, MAF and eviction buffers
//! - [`loopback`] - private-cache and network model for simulation and tests

pub mod controller;
pub mod core;
pub mod directory;
pub mod loopback;
pub mod protocol;

pub use controller::{CacheCoherenceController, ControllerConfig, MissAddressFile, MissTracker, Port};
pub use core::{
    Address, CoherenceError, CoherenceResult, ControllerStats, Destination, Message, MessageType,
    NodeId, StageTiming,
};
pub use directory::{Directory, DirectoryKind, SharingState, SharingVector};
pub use loopback::{Access, Loopback};
pub use protocol::{Action, CacheState, MesiTableProtocol, Protocol};
