// The per-tile directory controller. It owns six bounded channels (request, snoop and
// reply, in each direction), three timed pipeline stages (MAF, tag, data), the miss
// address file, the directory, the tile cache line states and two eviction buffers. Each
// call to tick runs three phases in order:
//
//   admit    - pick incoming work by strict priority and claim its worst-case needs
//   resolve  - consult the protocol and decide snoops, replies and MAF changes
//   complete - move transactions from the tag stage to the data stage and finalize
//
// A transaction that cannot claim its whole envelope is never admitted, so once it is in
// the pipeline it can always finish. Claims are tracked per transaction in a ReceiptSet;
// resolve refunds what the decided action does not need and finalize turns the rest into
// channel or buffer occupancy.

//! Cache-coherence directory controller.

mod admission;
pub mod cache_array;
pub mod config;
pub mod evict_buffer;
mod finalize;
pub mod maf;
mod resolve;
pub mod transaction;

pub use cache_array::CacheArray;
pub use config::ControllerConfig;
pub use evict_buffer::{EvictBuffer, EvictEntry};
pub use maf::{MafEntry, MafHandle, MafState, MissAddressFile, MissTracker};
pub use transaction::{Transaction, TransactionKind};

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io::{Read, Write};
use std::rc::Rc;

use crate::core::{
    Address, CoherenceError, CoherenceResult, ControllerStats, Cycle, Message, NodeId,
    ReservedQueue, Resource, TimedPipelineStage,
};
use crate::directory::{load_snapshot, save_snapshot, Directory, DirectoryEntry};
use crate::protocol::{CacheState, MesiTableProtocol, Protocol};

/// Controller channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Port {
    RequestIn,
    SnoopIn,
    ReplyIn,
    RequestOut,
    SnoopOut,
    ReplyOut,
}

impl Port {
    pub const ALL: [Port; 6] = [
        Port::RequestIn,
        Port::SnoopIn,
        Port::ReplyIn,
        Port::RequestOut,
        Port::SnoopOut,
        Port::ReplyOut,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Port::RequestIn => "request_in",
            Port::SnoopIn => "snoop_in",
            Port::ReplyIn => "reply_in",
            Port::RequestOut => "request_out",
            Port::SnoopOut => "snoop_out",
            Port::ReplyOut => "reply_out",
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub struct CacheCoherenceController {
    config: ControllerConfig,
    now: Cycle,
    next_tx: u64,

    request_in: ReservedQueue<Message>,
    snoop_in: ReservedQueue<Message>,
    reply_in: ReservedQueue<Message>,
    request_out: ReservedQueue<Message>,
    snoop_out: ReservedQueue<Message>,
    reply_out: ReservedQueue<Message>,

    maf_stage: TimedPipelineStage<Transaction>,
    tag_stage: TimedPipelineStage<Transaction>,
    data_stage: TimedPipelineStage<Transaction>,

    directory: Box<dyn Directory>,
    protocol: Box<dyn Protocol>,
    maf: Box<dyn MissTracker>,
    lines: CacheArray,
    cache_eb: EvictBuffer,
    dir_eb: EvictBuffer,

    /// Entries the directory evicted during the current lookup.
    victims: Rc<RefCell<VecDeque<DirectoryEntry>>>,
    /// Tile-cache lines queued for replacement.
    idle_work: VecDeque<Address>,
    idle_work_in_flight: bool,

    stats: ControllerStats,
}

impl CacheCoherenceController {
    /// Build a controller with the reference protocol, MAF and the configured directory.
    pub fn new(config: ControllerConfig) -> CoherenceResult<Self> {
        let directory = config.directory.build(config.block_size)?;
        let maf = Box::new(MissAddressFile::new(
            format!("{}.maf", config.name),
            config.maf_size,
        ));
        Self::with_parts(config, directory, Box::new(MesiTableProtocol::new()), maf)
    }

    pub fn with_parts(
        config: ControllerConfig,
        mut directory: Box<dyn Directory>,
        protocol: Box<dyn Protocol>,
        maf: Box<dyn MissTracker>,
    ) -> CoherenceResult<Self> {
        config.validate(protocol.max_snoops_per_request())?;
        let victims: Rc<RefCell<VecDeque<DirectoryEntry>>> = Rc::default();
        let sink = Rc::clone(&victims);
        directory.set_eviction_hook(Box::new(move |entry| sink.borrow_mut().push_back(entry)));

        let channel = |port: Port| ReservedQueue::new(format!("{}.{}", config.name, port), config.queue_size);
        let controller = Self {
            request_in: channel(Port::RequestIn),
            snoop_in: channel(Port::SnoopIn),
            reply_in: channel(Port::ReplyIn),
            request_out: channel(Port::RequestOut),
            snoop_out: channel(Port::SnoopOut),
            reply_out: channel(Port::ReplyOut),
            maf_stage: TimedPipelineStage::new(format!("{}.maf_stage", config.name), config.maf_timing)?,
            tag_stage: TimedPipelineStage::new(format!("{}.tag_stage", config.name), config.tag_timing)?,
            data_stage: TimedPipelineStage::new(format!("{}.data_stage", config.name), config.data_timing)?,
            directory,
            protocol,
            maf,
            lines: CacheArray::new(),
            cache_eb: EvictBuffer::new(format!("{}.cache_eb", config.name), config.cache_evict_buffer_size),
            dir_eb: EvictBuffer::new(format!("{}.dir_eb", config.name), config.dir_evict_buffer_size),
            victims,
            idle_work: VecDeque::new(),
            idle_work_in_flight: false,
            stats: ControllerStats::default(),
            now: 0,
            next_tx: 0,
            config,
        };
        log::info!(
            "{}: {} nodes, {} directory, {} protocol",
            controller.config.name,
            controller.config.num_nodes,
            controller.directory.name(),
            controller.protocol.name()
        );
        Ok(controller)
    }

    /// Advance one cycle.
    pub fn tick(&mut self) -> CoherenceResult<()> {
        self.admit()?;
        self.resolve()?;
        self.complete()?;
        self.stats.ticks += 1;
        self.now += 1;
        Ok(())
    }

    /// Tick until nothing is left in flight; returns the ticks taken.
    pub fn run_until_quiesced(&mut self, max_ticks: u64) -> CoherenceResult<u64> {
        let start = self.now;
        while !self.is_quiesced() {
            if self.now - start >= max_ticks {
                for line in self.maf.dump() {
                    log::warn!("{}: outstanding {}", self.config.name, line);
                }
                return Err(CoherenceError::UndischargedObligation {
                    id: self.next_tx,
                    detail: format!("not quiesced after {max_ticks} ticks"),
                });
            }
            self.tick()?;
        }
        Ok(self.now - start)
    }

    /// True when nothing is queued, in flight or waiting. Parked tile-cache
    /// replacements may remain.
    pub fn is_quiesced(&self) -> bool {
        Port::ALL.iter().all(|port| self.port(*port).is_empty())
            && self.maf_stage.is_empty()
            && self.tag_stage.is_empty()
            && self.data_stage.is_empty()
            && self.maf.is_empty()
            && self.dir_eb.is_empty()
            && self.cache_eb.draining() == 0
            && !self.cache_eb.drain_due()
            && self.idle_work.is_empty()
            && !self.idle_work_in_flight
    }

    pub fn port(&self, port: Port) -> &ReservedQueue<Message> {
        match port {
            Port::RequestIn => &self.request_in,
            Port::SnoopIn => &self.snoop_in,
            Port::ReplyIn => &self.reply_in,
            Port::RequestOut => &self.request_out,
            Port::SnoopOut => &self.snoop_out,
            Port::ReplyOut => &self.reply_out,
        }
    }

    pub fn port_mut(&mut self, port: Port) -> &mut ReservedQueue<Message> {
        match port {
            Port::RequestIn => &mut self.request_in,
            Port::SnoopIn => &mut self.snoop_in,
            Port::ReplyIn => &mut self.reply_in,
            Port::RequestOut => &mut self.request_out,
            Port::SnoopOut => &mut self.snoop_out,
            Port::ReplyOut => &mut self.reply_out,
        }
    }

    /// Deliver a request or a private-cache eviction notice.
    pub fn push_request(&mut self, message: Message) -> CoherenceResult<()> {
        self.check_node(message.source)?;
        self.check_node(message.requester)?;
        self.request_in.enqueue(message)
    }

    /// Deliver an eviction notice on the snoop channel.
    pub fn push_snoop(&mut self, message: Message) -> CoherenceResult<()> {
        self.check_node(message.source)?;
        self.snoop_in.enqueue(message)
    }

    /// Deliver a snoop response.
    pub fn push_reply(&mut self, message: Message) -> CoherenceResult<()> {
        self.check_node(message.source)?;
        self.reply_in.enqueue(message)
    }

    /// Only the configured private caches may send to the tile.
    fn check_node(&self, node: NodeId) -> CoherenceResult<()> {
        if usize::from(node) < self.config.num_nodes {
            return Ok(());
        }
        log::error!(
            "{}: message from node {} outside 0..{}",
            self.config.name,
            node,
            self.config.num_nodes
        );
        Err(CoherenceError::InvalidNode { node })
    }

    pub fn pop_output(&mut self, port: Port) -> Option<Message> {
        self.port_mut(port).dequeue()
    }

    /// Queue a tile-cache line for replacement.
    pub fn schedule_replacement(&mut self, address: Address) {
        self.idle_work.push_back(address);
    }

    pub fn save_directory(&self, writer: impl Write) -> CoherenceResult<usize> {
        save_snapshot(self.directory.as_ref(), writer)
    }

    /// Replace the directory contents; only allowed while quiesced.
    pub fn load_directory(&mut self, reader: impl Read) -> CoherenceResult<usize> {
        if !self.is_quiesced() {
            return Err(CoherenceError::Config {
                reason: format!("{}: directory can only be loaded while quiesced", self.config.name),
            });
        }
        load_snapshot(self.directory.as_mut(), reader)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn now(&self) -> Cycle {
        self.now
    }

    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    pub fn directory(&self) -> &dyn Directory {
        self.directory.as_ref()
    }

    pub fn maf(&self) -> &dyn MissTracker {
        self.maf.as_ref()
    }

    pub fn cache_state(&self, address: Address) -> CacheState {
        self.lines.state(address)
    }

    /// Seed the tile cache, e.g. to model a line already present.
    pub fn set_cache_state(&mut self, address: Address, state: CacheState) {
        self.lines.set(address, state);
    }

    pub fn cache_evict_buffer(&self) -> &EvictBuffer {
        &self.cache_eb
    }

    pub fn dir_evict_buffer(&self) -> &EvictBuffer {
        &self.dir_eb
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_tx;
        self.next_tx += 1;
        id
    }

    fn pool_reserve(&mut self, resource: Resource, n: u32) -> CoherenceResult<()> {
        let n = n as usize;
        match resource {
            Resource::SnoopOut => self.snoop_out.reserve(n),
            Resource::ReplyOut => self.reply_out.reserve(n),
            Resource::RequestOut => self.request_out.reserve(n),
            Resource::CacheEvictBuffer => self.cache_eb.reserve(n),
            Resource::DirEvictBuffer => self.dir_eb.reserve(n),
            Resource::Maf => (0..n).try_for_each(|_| self.maf.reserve()),
        }
    }

    fn pool_unreserve(&mut self, resource: Resource, n: u32) -> CoherenceResult<()> {
        let n = n as usize;
        match resource {
            Resource::SnoopOut => self.snoop_out.unreserve(n),
            Resource::ReplyOut => self.reply_out.unreserve(n),
            Resource::RequestOut => self.request_out.unreserve(n),
            Resource::CacheEvictBuffer => self.cache_eb.unreserve(n),
            Resource::DirEvictBuffer => self.dir_eb.unreserve(n),
            Resource::Maf => (0..n).try_for_each(|_| self.maf.unreserve()),
        }
    }

    fn pool_has_space(&self, resource: Resource, n: u32) -> bool {
        let n = n as usize;
        match resource {
            Resource::SnoopOut => self.snoop_out.has_space(n),
            Resource::ReplyOut => self.reply_out.has_space(n),
            Resource::RequestOut => self.request_out.has_space(n),
            Resource::CacheEvictBuffer => self.cache_eb.has_space(n),
            Resource::DirEvictBuffer => self.dir_eb.has_space(n),
            Resource::Maf => self.maf.has_space(n),
        }
    }

    /// Claim `n` of `resource` for `tx`.
    fn acquire(&mut self, tx: &mut Transaction, resource: Resource, n: u32) -> CoherenceResult<()> {
        if n == 0 {
            return Ok(());
        }
        self.pool_reserve(resource, n)?;
        tx.receipts.acquire(resource, n);
        self.stats.receipts_acquired += u64::from(n);
        Ok(())
    }

    /// Give `n` claims of `resource` back to the pool.
    fn release(&mut self, tx: &mut Transaction, resource: Resource, n: u32) -> CoherenceResult<()> {
        if n == 0 {
            return Ok(());
        }
        tx.receipts.release(resource, n)?;
        self.pool_unreserve(resource, n)?;
        self.stats.receipts_released += u64::from(n);
        Ok(())
    }

    /// Consume a claim: the slot is now occupied.
    fn transfer(&mut self, tx: &mut Transaction, resource: Resource) -> CoherenceResult<()> {
        tx.receipts.transfer(resource, 1)?;
        self.stats.receipts_transferred += 1;
        Ok(())
    }
}

impl fmt::Debug for CacheCoherenceController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheCoherenceController")
            .field("name", &self.config.name)
            .field("now", &self.now)
            .field("maf", &self.maf.len())
            .field("directory", &self.directory.len())
            .field("cache_eb", &self.cache_eb.len())
            .field("dir_eb", &self.dir_eb.len())
            .finish()
    }
}
