// Loopback harness for driving a controller without a real network. It models the
// private caches of every node (which lines they hold, whether writable and dirty), the
// network between them and the tile, and memory (writebacks and fills are recorded and
// otherwise dropped). Replies reach the private caches as soon as they leave the
// controller. Snoops reach them after a separate snoop delay, zero by default, so a snoop
// can still be on its way while the node evicts the line or the tile hears from other
// nodes. Messages toward the tile share one delay; each channel is delivered in order,
// and a node's request never overtakes an eviction notice it sent earlier. Each node has
// at most one outstanding miss per line.

//! Private-cache and network stand-in used by the simulator and the tests.

use std::collections::VecDeque;

use hashbrown::{HashMap, HashSet};

use crate::controller::{CacheCoherenceController, Port};
use crate::core::{Address, CoherenceError, CoherenceResult, Cycle, Destination, Message, MessageType, NodeId};
use crate::directory::Directory;

/// A line held by a private cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrivateCopy {
    pub writable: bool,
    pub dirty: bool,
}

/// Outcome of a private-cache access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Hit,
    Issued(MessageType),
    /// A miss for the line is already outstanding.
    Busy,
}

#[derive(Debug)]
struct Delivery {
    due: Cycle,
    port: Port,
    message: Message,
}

pub struct Loopback {
    tile: NodeId,
    delay: Cycle,
    snoop_delay: Cycle,
    now: Cycle,
    copies: HashMap<(NodeId, Address), PrivateCopy>,
    outstanding: HashSet<(NodeId, Address)>,
    in_flight: VecDeque<Delivery>,
    /// Snoops on their way to private caches: (due, node, snoop).
    snoops_in_flight: VecDeque<(Cycle, NodeId, Message)>,
    replies: Vec<Message>,
    snoops: Vec<Message>,
    memory: Vec<Message>,
}

impl Loopback {
    pub fn new(tile: NodeId, delay: Cycle) -> Self {
        Self {
            tile,
            delay,
            snoop_delay: 0,
            now: 0,
            copies: HashMap::new(),
            outstanding: HashSet::new(),
            in_flight: VecDeque::new(),
            snoops_in_flight: VecDeque::new(),
            replies: Vec::new(),
            snoops: Vec::new(),
            memory: Vec::new(),
        }
    }

    /// Hold snoops for `delay` cycles before the private caches see them.
    pub fn with_snoop_delay(mut self, delay: Cycle) -> Self {
        self.snoop_delay = delay;
        self
    }

    /// Send request `kind` for `address` from `node` toward the tile's request channel.
    /// Returns false while a miss for the line is outstanding; evictions go through [`Loopback::evict`].
    pub fn issue(
        &mut self,
        ctrl: &CacheCoherenceController,
        node: NodeId,
        kind: MessageType,
        address: Address,
    ) -> CoherenceResult<bool> {
        if self.outstanding.contains(&(node, address)) {
            return Ok(false);
        }
        if !kind.is_request() {
            return Err(CoherenceError::InvalidMessage {
                kind,
                operation: "loopback issue",
            });
        }
        self.now = ctrl.now();
        self.schedule(Port::RequestIn, Message::request(kind, address, node, self.tile));
        self.outstanding.insert((node, address));
        Ok(true)
    }

    /// A load (`write == false`) or store by `node`.
    pub fn access(
        &mut self,
        ctrl: &CacheCoherenceController,
        node: NodeId,
        address: Address,
        write: bool,
    ) -> CoherenceResult<Access> {
        let kind = match (self.copies.get_mut(&(node, address)), write) {
            (Some(_), false) => return Ok(Access::Hit),
            (Some(copy), true) if copy.writable => {
                copy.dirty = true;
                return Ok(Access::Hit);
            }
            (Some(_), true) => MessageType::UpgradeReq,
            (None, true) => MessageType::WriteReq,
            (None, false) => MessageType::ReadReq,
        };
        if self.issue(ctrl, node, kind, address)? {
            Ok(Access::Issued(kind))
        } else {
            Ok(Access::Busy)
        }
    }

    /// Drop `node`'s copy of `address` and notify the tile after the network delay.
    pub fn evict(&mut self, node: NodeId, address: Address) -> Option<MessageType> {
        if self.outstanding.contains(&(node, address)) {
            return None;
        }
        let copy = self.copies.remove(&(node, address))?;
        let kind = match (copy.writable, copy.dirty) {
            (_, true) => MessageType::EvictDirty,
            (true, false) => MessageType::EvictWritable,
            (false, false) => MessageType::EvictClean,
        };
        let notice = Message::new(kind, address, node, Destination::Node(self.tile));
        self.schedule(Port::SnoopIn, notice);
        Some(kind)
    }

    /// Tick the controller once, then move messages between it and the model.
    pub fn step(&mut self, ctrl: &mut CacheCoherenceController) -> CoherenceResult<()> {
        ctrl.tick()?;
        self.now = ctrl.now();
        while let Some(reply) = ctrl.pop_output(Port::ReplyOut) {
            self.receive_reply(reply)?;
        }
        let due = self.now + self.snoop_delay;
        while let Some(snoop) = ctrl.pop_output(Port::SnoopOut) {
            match snoop.destination {
                Destination::Memory => self.memory.push(snoop),
                Destination::Node(node) => self.snoops_in_flight.push_back((due, node, snoop)),
                Destination::Multicast(nodes) => {
                    for node in nodes.iter() {
                        self.snoops_in_flight.push_back((due, node, snoop.clone()));
                    }
                    self.snoops.push(snoop);
                }
            }
        }
        while let Some(request) = ctrl.pop_output(Port::RequestOut) {
            self.memory.push(request);
        }
        while self
            .snoops_in_flight
            .front()
            .is_some_and(|(due, _, _)| *due <= self.now)
        {
            if let Some((_, node, snoop)) = self.snoops_in_flight.pop_front() {
                self.receive_snoop(node, &snoop)?;
            }
        }
        self.deliver(ctrl)
    }

    /// Step until the controller is quiesced and nothing is in flight.
    pub fn run_until_quiesced(
        &mut self,
        ctrl: &mut CacheCoherenceController,
        max_ticks: u64,
    ) -> CoherenceResult<u64> {
        let start = ctrl.now();
        while !(self.is_idle() && ctrl.is_quiesced()) {
            if ctrl.now() - start >= max_ticks {
                for line in ctrl.maf().dump() {
                    log::warn!("loopback: outstanding {line}");
                }
                return Err(CoherenceError::UndischargedObligation {
                    id: 0,
                    detail: format!(
                        "{} deliveries, {} snoops and {} misses outstanding after {max_ticks} ticks",
                        self.in_flight.len(),
                        self.snoops_in_flight.len(),
                        self.outstanding.len()
                    ),
                });
            }
            self.step(ctrl)?;
        }
        Ok(ctrl.now() - start)
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.snoops_in_flight.is_empty() && self.outstanding.is_empty()
    }

    /// Give every sharer recorded in `dir` a clean shared copy, e.g. after loading a
    /// directory snapshot.
    pub fn adopt_directory(&mut self, dir: &dyn Directory) -> usize {
        let mut adopted = 0;
        for entry in dir.entries() {
            for node in entry.sharers().iter() {
                self.copies
                    .insert((node, entry.address()), PrivateCopy::default());
                adopted += 1;
            }
        }
        adopted
    }

    pub fn copy(&self, node: NodeId, address: Address) -> Option<PrivateCopy> {
        self.copies.get(&(node, address)).copied()
    }

    /// Nodes holding `address`, in ascending order.
    pub fn holders(&self, address: Address) -> Vec<NodeId> {
        let mut nodes: Vec<_> = self
            .copies
            .keys()
            .filter(|(_, a)| *a == address)
            .map(|(n, _)| *n)
            .collect();
        nodes.sort_unstable();
        nodes
    }

    pub fn has_outstanding(&self, node: NodeId, address: Address) -> bool {
        self.outstanding.contains(&(node, address))
    }

    /// Replies delivered to private caches, in arrival order.
    pub fn replies(&self) -> &[Message] {
        &self.replies
    }

    /// Multicast snoops observed.
    pub fn multicasts(&self) -> &[Message] {
        &self.snoops
    }

    /// Writebacks and forwarded requests that reached memory.
    pub fn memory_traffic(&self) -> &[Message] {
        &self.memory
    }

    fn schedule(&mut self, port: Port, message: Message) {
        self.in_flight.push_back(Delivery {
            due: self.now + self.delay,
            port,
            message,
        });
    }

    fn deliver(&mut self, ctrl: &mut CacheCoherenceController) -> CoherenceResult<()> {
        let mut pending = std::mem::take(&mut self.in_flight);
        let mut blocked: HashSet<Port> = HashSet::new();
        // Nodes with an eviction notice still held back this step.
        let mut notices: HashSet<NodeId> = HashSet::new();
        while let Some(delivery) = pending.pop_front() {
            if delivery.due > self.now {
                self.in_flight.push_back(delivery);
                self.in_flight.append(&mut pending);
                break;
            }
            let port = delivery.port;
            let source = delivery.message.source;
            let behind_notice = port == Port::RequestIn && notices.contains(&source);
            if behind_notice || blocked.contains(&port) || !ctrl.port(port).has_space(1) {
                blocked.insert(port);
                if port == Port::SnoopIn {
                    notices.insert(source);
                }
                self.in_flight.push_back(delivery);
                continue;
            }
            match port {
                Port::SnoopIn => ctrl.push_snoop(delivery.message)?,
                Port::ReplyIn => ctrl.push_reply(delivery.message)?,
                _ => ctrl.push_request(delivery.message)?,
            }
        }
        Ok(())
    }

    fn receive_reply(&mut self, reply: Message) -> CoherenceResult<()> {
        let Destination::Node(node) = reply.destination else {
            return Err(CoherenceError::InvalidMessage {
                kind: reply.kind,
                operation: "loopback reply delivery",
            });
        };
        let key = (node, reply.address);
        let done = match reply.kind {
            MessageType::MissReply => {
                self.copies.insert(key, PrivateCopy::default());
                true
            }
            MessageType::MissReplyWritable | MessageType::MissReplyDirty | MessageType::UpgradeReply => {
                self.copies.insert(key, PrivateCopy { writable: true, dirty: true });
                true
            }
            MessageType::NonAllocatingStoreReply => true,
            MessageType::MissNotify => false,
            kind => {
                return Err(CoherenceError::InvalidMessage {
                    kind,
                    operation: "loopback reply delivery",
                })
            }
        };
        if done {
            self.outstanding.remove(&key);
        }
        self.replies.push(reply);
        Ok(())
    }

    fn receive_snoop(&mut self, node: NodeId, snoop: &Message) -> CoherenceResult<()> {
        let key = (node, snoop.address);
        let copy = self.copies.get(&key).copied();
        let dirty = copy.is_some_and(|c| c.dirty);
        let response = match (snoop.kind, copy) {
            (MessageType::Invalidate, _) => {
                self.copies.remove(&key);
                if dirty {
                    MessageType::InvUpdateAck
                } else {
                    MessageType::InvalidateAck
                }
            }
            // The line was evicted and the notice is still in flight.
            (MessageType::Downgrade | MessageType::ReturnReq, None) => MessageType::ReturnNAck,
            (MessageType::Downgrade, Some(_)) => {
                self.copies.insert(key, PrivateCopy::default());
                if dirty {
                    MessageType::DownUpdateAck
                } else {
                    MessageType::DowngradeAck
                }
            }
            (MessageType::ReturnReq, Some(_)) => {
                self.copies.insert(key, PrivateCopy::default());
                if dirty {
                    MessageType::ReturnReplyDirty
                } else {
                    MessageType::ReturnReply
                }
            }
            (kind, _) => {
                return Err(CoherenceError::InvalidMessage {
                    kind,
                    operation: "loopback snoop delivery",
                })
            }
        };
        log::trace!("loopback: node {node} answers {} with {response}", snoop);
        let message = Message::new(response, snoop.address, node, Destination::Node(self.tile))
            .with_requester(snoop.requester);
        self.schedule(Port::ReplyIn, message);
        Ok(())
    }
}
