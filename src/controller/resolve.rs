// Resolve phase. Transactions whose MAF-stage latency has elapsed are taken in order and
// dispatched by admission class. Each handler reads the directory and tile cache, asks
// the protocol for a rule, and records on the transaction what finalize has to do:
// snoops, the reply, a forwarded request, the MAF effect, and how many tag lookups the
// transaction occupies. Directory and tile-cache changes for immediate actions happen
// here; actions that wait for acks store the next state in their MAF entry and apply it
// when the last ack arrives.
//
// Conflicting work is deferred rather than dropped. A fresh request stalls behind any
// MAF entry for its line, a woken one only behind an entry that still owns the line, and
// requests for a line that is on its way out wait for the eviction to finish. A
// directory victim is on its way out until every sharer has acked its back-invalidate.

use crate::core::{
    Address, CoherenceError, CoherenceResult, Destination, Message, MessageType, NodeId, Resource,
};
use crate::directory::SharingVector;
use crate::protocol::{Action, CacheState};

use super::evict_buffer::EvictEntry;
use super::maf::{MafEntry, MafHandle, MafState};
use super::{CacheCoherenceController, Transaction, TransactionKind};

impl CacheCoherenceController {
    pub(super) fn resolve(&mut self) -> CoherenceResult<()> {
        while self.maf_stage.ready(self.now) && self.tag_stage.server_avail(self.now) {
            let Some(mut tx) = self.maf_stage.dequeue() else {
                break;
            };
            match tx.kind {
                TransactionKind::Request => self.resolve_request(&mut tx)?,
                TransactionKind::WakeMAF => self.resolve_request(&mut tx)?,
                TransactionKind::Snoop => self.resolve_eviction(&mut tx)?,
                TransactionKind::Reply => self.resolve_snoop_response(&mut tx)?,
                TransactionKind::CacheEvict => self.resolve_cache_evict(&mut tx)?,
                TransactionKind::DirEvict => self.resolve_dir_evict(&mut tx)?,
                TransactionKind::IdleWork => self.resolve_idle_work(&mut tx)?,
            }
            self.settle(&mut tx)?;
            self.stats.record_action(tx.action.name());
            log::debug!("{}: resolved {}", self.config.name, tx);
            if tx.lookups > 0 {
                let lookups = tx.lookups;
                self.tag_stage.enqueue(tx, lookups, self.now)?;
            } else {
                self.finalize(tx)?;
            }
        }
        Ok(())
    }

    /// Check the decided outputs against the action and refund unused claims.
    fn settle(&mut self, tx: &mut Transaction) -> CoherenceResult<()> {
        let contract = tx.action.contract();
        if contract.snoops == tx.snoops.is_empty() || contract.reply != tx.reply.is_some() {
            return Err(CoherenceError::UndischargedObligation {
                id: tx.id,
                detail: format!(
                    "{} expects snoops={} reply={}, resolved {} snoops and reply={}",
                    tx.action,
                    contract.snoops,
                    contract.reply,
                    tx.snoops.len(),
                    tx.reply.is_some()
                ),
            });
        }
        let keep = [
            (Resource::SnoopOut, tx.snoops.len() as u32),
            (Resource::ReplyOut, u32::from(tx.reply.is_some())),
            (Resource::RequestOut, u32::from(tx.forward.is_some())),
            (Resource::Maf, 0),
            (Resource::CacheEvictBuffer, 0),
            (Resource::DirEvictBuffer, 0),
        ];
        for (resource, keep) in keep {
            let refund = tx.receipts.refund_above(resource, keep)?;
            if refund > 0 {
                self.pool_unreserve(resource, refund)?;
                self.stats.receipts_released += u64::from(refund);
            }
        }
        Ok(())
    }

    /// A request from a private cache, fresh or readmitted from the MAF.
    fn resolve_request(&mut self, tx: &mut Transaction) -> CoherenceResult<()> {
        let kind = tx.message.kind;
        let woken = tx.maf.is_some();
        if kind.is_eviction() && !woken {
            return self.resolve_eviction(tx);
        }
        if !kind.is_request() {
            return Err(CoherenceError::InvalidMessage {
                kind,
                operation: "resolve request",
            });
        }
        let address = tx.message.address;
        let requester = tx.message.requester;

        if let Some(state) = self.conflicting_entry(address, tx.maf) {
            log::debug!(
                "{}: {} deferred behind {:?} entry",
                self.config.name,
                tx.message,
                state
            );
            for line in self.maf.dump() {
                log::debug!("{}:   {}", self.config.name, line);
            }
            self.stats.deferred_requests += 1;
            return self.stall(tx, MafState::WaitRequest);
        }
        if self.dir_eb.contains(address) || self.cache_eb.is_draining(address) {
            return self.stall(tx, MafState::WaitEvict);
        }
        self.reclaim_parked(address);

        // Allocating into a full set needs a slot for the victim.
        let needed = self.directory.eviction_requirement(address);
        let held = tx.receipts.held(Resource::DirEvictBuffer);
        if needed > held {
            if self.dir_eb.has_space((needed - held) as usize) {
                self.acquire(tx, Resource::DirEvictBuffer, needed - held)?;
            } else {
                return self.stall(tx, MafState::WaitSet);
            }
        }
        let lookup = self.directory.lookup(requester, address, kind)?;
        self.collect_victims(tx)?;
        let Some(handle) = lookup.handle else {
            return self.stall(tx, MafState::WaitSet);
        };
        tx.entry = Some(handle);

        let mut kind = kind;
        if kind == MessageType::UpgradeReq && !lookup.sharers.contains(requester) {
            // The copy was invalidated while the upgrade was in flight.
            kind = MessageType::WriteReq;
            tx.message.kind = kind;
        }
        if kind != MessageType::UpgradeReq && lookup.sharers.contains(requester) {
            // The requester's eviction of this line has not arrived yet.
            return self.stall(tx, MafState::WaitEvict);
        }

        let cache = self.lines.state(address);
        let rule = self
            .protocol
            .transition(cache, lookup.state, kind)
            .inspect_err(|err| log::error!("{}: {} on {}", self.config.name, err, tx.message))?;

        match rule.action {
            Action::Reply { reply } => {
                self.directory
                    .process_request_response(requester, kind, Some(reply), address)?;
                if let Some(state) = rule.next_state {
                    self.lines.set(address, state);
                }
                tx.reply = Some(self.reply_to(&tx.message, reply));
                tx.requires_data = rule.requires_data;
                if rule.requires_data && cache == CacheState::Invalid {
                    tx.forward = Some(self.fill_request(&tx.message));
                }
                if kind == MessageType::UpgradeReq && !woken {
                    tx.action = Action::Reply { reply };
                } else {
                    tx.action = Action::ReplyAndRemove { reply };
                    let entry = MafEntry::new(tx.message.clone(), MafState::Finishing);
                    self.hold_maf(tx, entry)?;
                }
            }
            Action::ForwardAndWaitAck { snoop, reply }
            | Action::NotifyAndWaitAck { snoop, reply }
            | Action::ForwardAndReply { snoop, reply } => {
                let targets = lookup.sharers.without(requester);
                let awaiting = self.build_snoops(tx, snoop, targets);
                let final_reply = self.reply_to(&tx.message, reply);
                let mut entry = MafEntry::new(tx.message.clone(), MafState::WaitAck);
                entry.awaiting = awaiting;
                entry.next_state = rule.next_state;
                entry.reply_requires_data = rule.requires_data;
                match rule.action {
                    Action::ForwardAndWaitAck { .. } => entry.pending_reply = Some(final_reply),
                    Action::NotifyAndWaitAck { .. } => {
                        let mut notify = self.reply_to(&tx.message, MessageType::MissNotify);
                        notify.outstanding = awaiting.count();
                        tx.reply = Some(notify);
                        entry.pending_reply = Some(final_reply);
                    }
                    _ => {
                        self.directory
                            .process_request_response(requester, kind, Some(reply), address)?;
                        tx.reply = Some(final_reply);
                        tx.requires_data = rule.requires_data;
                    }
                }
                if rule.requires_data
                    && cache == CacheState::Invalid
                    && !matches!(snoop, MessageType::ReturnReq | MessageType::Downgrade)
                {
                    tx.forward = Some(self.fill_request(&tx.message));
                }
                tx.action = rule.action;
                self.hold_maf(tx, entry)?;
            }
            other => {
                log::error!("{}: {} cannot resolve a request", self.config.name, other);
                return Err(CoherenceError::InvalidMessage {
                    kind,
                    operation: "request action",
                });
            }
        }
        tx.lookups = 1;
        Ok(())
    }

    /// Restore a line parked in the cache eviction buffer.
    fn reclaim_parked(&mut self, address: Address) {
        if let Some(parked) = self.cache_eb.reclaim(address) {
            log::debug!("{}: reclaimed {:#x} from {}", self.config.name, address, self.cache_eb.name());
            self.lines.set(address, parked.state);
            self.stats.evict_buffer_reclaims += 1;
        }
    }

    /// State of the MAF entry `address` has to wait behind, if any.
    fn conflicting_entry(&self, address: Address, own: Option<MafHandle>) -> Option<MafState> {
        if own.is_some() {
            let active = self.maf.find_active(address)?;
            return self.maf.get(active).map(|entry| entry.state);
        }
        self.maf
            .entries_for(address)
            .first()
            .map(|(_, entry)| entry.state)
    }

    /// Park `tx` in the MAF with `state`, dropping its directory pin.
    fn stall(&mut self, tx: &mut Transaction, state: MafState) -> CoherenceResult<()> {
        if let Some(handle) = tx.entry.take() {
            self.directory.release(handle);
        }
        match tx.maf {
            Some(handle) => self.maf.set_state(handle, state)?,
            None => {
                self.release(tx, Resource::Maf, 1)?;
                let handle = self.maf.insert(MafEntry::new(tx.message.clone(), state))?;
                tx.maf = Some(handle);
            }
        }
        log::debug!("{}: stall {} in {:?}", self.config.name, tx.message, state);
        tx.action = Action::Stall;
        tx.lookups = 0;
        Ok(())
    }

    /// Record `entry` for `tx`, moving the directory pin into it.
    fn hold_maf(&mut self, tx: &mut Transaction, mut entry: MafEntry) -> CoherenceResult<()> {
        entry.pin = tx.entry.take();
        match tx.maf {
            Some(handle) => {
                let slot = self
                    .maf
                    .get_mut(handle)
                    .ok_or(CoherenceError::UnknownMafEntry(handle.id()))?;
                *slot = entry;
            }
            None => {
                self.release(tx, Resource::Maf, 1)?;
                tx.maf = Some(self.maf.insert(entry)?);
            }
        }
        Ok(())
    }

    /// Move entries the directory evicted during lookup into the eviction buffer.
    fn collect_victims(&mut self, tx: &mut Transaction) -> CoherenceResult<()> {
        loop {
            let victim = self.victims.borrow_mut().pop_front();
            let Some(victim) = victim else {
                return Ok(());
            };
            log::debug!(
                "{}: directory victim {:#x} sharers {:?}",
                self.config.name,
                victim.address(),
                victim.sharers()
            );
            self.transfer(tx, Resource::DirEvictBuffer)?;
            self.dir_eb
                .commit(EvictEntry::victim(victim.address(), victim.sharers()))?;
            self.stats.directory_evictions += 1;
        }
    }

    /// Build snoops for `targets`; returns the nodes that will answer.
    fn build_snoops(
        &mut self,
        tx: &mut Transaction,
        snoop: MessageType,
        targets: SharingVector,
    ) -> SharingVector {
        let requester = tx.message.requester;
        let Some(closest) = targets.closest(requester) else {
            return SharingVector::new();
        };
        let tile = self.config.tile;
        tx.snoops
            .push(tx.message.derived(snoop, tile, Destination::Node(closest)));
        if snoop != MessageType::Invalidate {
            return SharingVector::from_nodes([closest]);
        }
        let rest = targets.without(closest);
        if !rest.is_empty() {
            tx.snoops
                .push(tx.message.derived(snoop, tile, Destination::Multicast(rest)));
        }
        targets
    }

    fn reply_to(&self, request: &Message, kind: MessageType) -> Message {
        request.derived(kind, self.config.tile, Destination::Node(request.requester))
    }

    fn fill_request(&self, request: &Message) -> Message {
        request.derived(request.kind, self.config.tile, Destination::Memory)
    }

    /// An eviction notice from a private cache.
    fn resolve_eviction(&mut self, tx: &mut Transaction) -> CoherenceResult<()> {
        let kind = tx.message.kind;
        if !kind.is_eviction() {
            return Err(CoherenceError::InvalidMessage {
                kind,
                operation: "resolve eviction",
            });
        }
        let node = tx.message.source;
        let address = tx.message.address;
        tx.lookups = 1;
        let lookup = self.directory.snoop_lookup(node, address, kind);
        if !lookup.valid || !lookup.sharers.contains(node) {
            if self.dir_eb.has_sharer(address, node) {
                return self.resolve_victim_eviction(tx);
            }
            log::debug!("{}: stale {} ignored", self.config.name, tx.message);
            tx.action = Action::NoAction;
            return Ok(());
        }
        // A parked replacement still describes the owner's line.
        self.reclaim_parked(address);
        let cache = self.lines.state(address);
        let rule = self
            .protocol
            .transition(cache, lookup.state, kind)
            .inspect_err(|err| log::error!("{}: {} on {}", self.config.name, err, tx.message))?;
        self.directory
            .process_request_response(node, kind, None, address)?;
        if let Some(state) = rule.next_state {
            self.lines.set(address, state);
        }
        tx.requires_data = rule.requires_data;

        let waiter = self.maf.find_waiting_on_evict(address, Some(node));
        tx.maf = waiter;
        tx.action = match (rule.action, waiter) {
            (Action::Forward { snoop }, waiter) => {
                let writeback = tx
                    .message
                    .derived(snoop, self.config.tile, Destination::Memory)
                    .with_requester(node);
                tx.snoops.push(writeback);
                if waiter.is_some() {
                    Action::ForwardAndWakeEvictMAF { snoop }
                } else {
                    Action::Forward { snoop }
                }
            }
            (Action::NoAction, Some(_)) => Action::WakeEvictMAF,
            (Action::NoAction, None) => Action::NoAction,
            (other, _) => {
                log::error!("{}: {} cannot resolve an eviction", self.config.name, other);
                return Err(CoherenceError::InvalidMessage {
                    kind,
                    operation: "eviction action",
                });
            }
        };
        Ok(())
    }

    /// A snoop response from a private cache.
    fn resolve_snoop_response(&mut self, tx: &mut Transaction) -> CoherenceResult<()> {
        let kind = tx.message.kind;
        if !kind.is_snoop_response() {
            return Err(CoherenceError::InvalidMessage {
                kind,
                operation: "resolve snoop response",
            });
        }
        let node = tx.message.source;
        let address = tx.message.address;
        if self.dir_eb.awaits_ack(address, node) {
            return self.resolve_victim_ack(tx);
        }
        let Some(handle) = self.maf.find_awaiting(address, node) else {
            log::debug!("{}: stray {} ignored", self.config.name, tx.message);
            self.stats.stray_acks += 1;
            tx.action = Action::NoAction;
            return Ok(());
        };
        tx.lookups = 1;

        let lookup = self.directory.snoop_lookup(node, address, kind);
        if lookup.valid {
            let cache = self.lines.state(address);
            let rule = self
                .protocol
                .transition(cache, lookup.state, kind)
                .inspect_err(|err| log::error!("{}: {} on {}", self.config.name, err, tx.message))?;
            self.directory.process_snoop_response(node, kind, address)?;
            if let Some(state) = rule.next_state {
                self.lines.set(address, state);
            }
            tx.requires_data |= rule.requires_data;
        }

        let remaining = self.maf.record_ack(handle, node)?;
        if remaining > 0 {
            log::trace!("{}: {} waiting on {} acks", self.config.name, handle, remaining);
            tx.action = Action::NoAction;
            return Ok(());
        }

        let entry = self
            .maf
            .get(handle)
            .ok_or(CoherenceError::UnknownMafEntry(handle.id()))?;
        let request = entry.request.clone();
        let pending = entry.pending_reply.clone();
        let next_state = entry.next_state;
        let requires_data = entry.reply_requires_data;

        if kind == MessageType::ReturnNAck && pending.is_some() {
            // The data source no longer holds the line.
            self.reclaim_parked(address);
            if self.lines.state(address) == CacheState::Invalid {
                if let Some(sharer) = self.data_source(address, request.requester) {
                    return self.reforward(tx, handle, &request, sharer);
                }
                tx.forward = Some(self.fill_request(&request));
            }
        }

        if let Some(state) = next_state {
            self.lines.set(address, state);
        }
        tx.maf = Some(handle);
        match pending {
            Some(mut reply) => {
                if request.kind == MessageType::UpgradeReq
                    && !self.is_sharer(address, request.requester)
                {
                    // The upgrader lost its copy while acks were outstanding.
                    reply.kind = MessageType::MissReplyWritable;
                }
                self.directory.process_request_response(
                    request.requester,
                    request.kind,
                    Some(reply.kind),
                    address,
                )?;
                self.maf.set_state(handle, MafState::Finishing)?;
                tx.action = Action::ReplyAndRemove { reply: reply.kind };
                tx.reply = Some(reply);
                tx.requires_data |= requires_data;
            }
            None => {
                tx.action = if self.maf.has_other_entries(address, handle) {
                    Action::RemoveAndWake
                } else {
                    Action::RemoveOnly
                };
            }
        }
        Ok(())
    }

    /// Sharer other than `requester` closest to it.
    fn data_source(&self, address: Address, requester: NodeId) -> Option<NodeId> {
        self.directory
            .find(address)
            .and_then(|entry| entry.sharers().without(requester).closest(requester))
    }

    /// Ask `sharer` for the data a NAcked snoop failed to return.
    fn reforward(
        &mut self,
        tx: &mut Transaction,
        handle: MafHandle,
        request: &Message,
        sharer: NodeId,
    ) -> CoherenceResult<()> {
        let entry = self
            .maf
            .get_mut(handle)
            .ok_or(CoherenceError::UnknownMafEntry(handle.id()))?;
        entry.awaiting = SharingVector::from_nodes([sharer]);
        let reply = entry
            .pending_reply
            .as_ref()
            .map_or(MessageType::MissReply, |reply| reply.kind);
        log::debug!(
            "{}: {:#x} NAcked, forwarding {} to node {}",
            self.config.name,
            request.address,
            request.kind,
            sharer
        );
        let snoop = MessageType::ReturnReq;
        tx.snoops
            .push(request.derived(snoop, self.config.tile, Destination::Node(sharer)));
        tx.action = Action::ForwardAndWaitAck { snoop, reply };
        Ok(())
    }

    /// An ack for a directory victim's back-invalidate.
    fn resolve_victim_ack(&mut self, tx: &mut Transaction) -> CoherenceResult<()> {
        let node = tx.message.source;
        let address = tx.message.address;
        tx.lookups = 1;
        match tx.message.kind {
            MessageType::InvUpdateAck => {
                // The dirty copy is written into the tile.
                self.reclaim_parked(address);
                self.lines.set(address, CacheState::Modified);
                tx.requires_data = true;
            }
            MessageType::InvalidateAck => {}
            kind => {
                return Err(CoherenceError::InvalidMessage {
                    kind,
                    operation: "back-invalidate ack",
                })
            }
        }
        let remaining = self.dir_eb.record_ack(address, node)?;
        if remaining > 0 {
            log::trace!("{}: victim {:#x} waiting on {} acks", self.config.name, address, remaining);
            tx.action = Action::NoAction;
            return Ok(());
        }
        self.finish_victim(tx)
    }

    /// An eviction notice from a sharer of a directory victim.
    fn resolve_victim_eviction(&mut self, tx: &mut Transaction) -> CoherenceResult<()> {
        let node = tx.message.source;
        let address = tx.message.address;
        self.dir_eb.remove_sharer(address, node);
        tx.action = Action::NoAction;
        if tx.message.kind != MessageType::EvictDirty {
            return Ok(());
        }
        self.reclaim_parked(address);
        if self.lines.state(address) == CacheState::Invalid {
            let snoop = MessageType::EvictDirty;
            let writeback = tx
                .message
                .derived(snoop, self.config.tile, Destination::Memory)
                .with_requester(node);
            tx.snoops.push(writeback);
            tx.action = Action::Forward { snoop };
        } else {
            self.lines.set(address, CacheState::Modified);
            tx.requires_data = true;
        }
        Ok(())
    }

    /// Retire the draining directory victim for the transaction's line.
    fn finish_victim(&mut self, tx: &mut Transaction) -> CoherenceResult<()> {
        let address = tx.message.address;
        self.dir_eb.finish_drain(address)?;
        self.maf.wake_set_waiter();
        if self.lines.state(address) == CacheState::Exclusive {
            // No private copy is left; the tile keeps the line dirty.
            self.lines.set(address, CacheState::Modified);
        }
        log::debug!("{}: victim {:#x} retired", self.config.name, address);
        tx.maf = self.maf.find_waiting_on_evict(address, None);
        tx.action = if tx.maf.is_some() {
            Action::WakeEvictMAF
        } else {
            Action::NoAction
        };
        Ok(())
    }

    fn is_sharer(&self, address: Address, node: NodeId) -> bool {
        self.directory
            .find(address)
            .is_some_and(|entry| entry.is_sharer(node))
    }

    /// Drain of a tile-cache replacement toward memory.
    fn resolve_cache_evict(&mut self, tx: &mut Transaction) -> CoherenceResult<()> {
        let snoop = tx.message.kind;
        tx.snoops.push(tx.message.clone());
        tx.maf = self.maf.find_waiting_on_evict(tx.message.address, None);
        tx.action = if tx.maf.is_some() {
            Action::ForwardAndWakeEvictMAF { snoop }
        } else {
            Action::Forward { snoop }
        };
        Ok(())
    }

    /// Back-invalidation of a directory victim's sharers.
    fn resolve_dir_evict(&mut self, tx: &mut Transaction) -> CoherenceResult<()> {
        let Destination::Multicast(sharers) = tx.message.destination else {
            return Err(CoherenceError::InvalidMessage {
                kind: tx.message.kind,
                operation: "directory eviction",
            });
        };
        if sharers.is_empty() {
            // Every sharer evicted the line while the victim was parked.
            return self.finish_victim(tx);
        }
        tx.snoops.push(tx.message.clone());
        tx.action = Action::Forward {
            snoop: MessageType::Invalidate,
        };
        Ok(())
    }

    /// Replacement of a tile-cache line.
    fn resolve_idle_work(&mut self, tx: &mut Transaction) -> CoherenceResult<()> {
        self.idle_work_in_flight = false;
        let address = tx.message.address;
        tx.action = Action::NoAction;
        tx.lookups = 1;
        let state = self.lines.state(address);
        let Some(kind) = self.protocol.evict(address, state) else {
            return Ok(());
        };
        if !self.maf.entries_for(address).is_empty() || self.cache_eb.contains(address) {
            log::debug!("{}: {:#x} busy, replacement skipped", self.config.name, address);
            return Ok(());
        }
        self.transfer(tx, Resource::CacheEvictBuffer)?;
        self.cache_eb
            .commit(EvictEntry::replacement(address, kind, state))?;
        self.lines.set(address, CacheState::Invalid);
        tx.message.kind = kind;
        Ok(())
    }
}
