//! Admission: strict-priority selection of incoming work.
//!
//! Each class has a fixed envelope of worst-case claims. A candidate is admitted only
//! when every claim of its envelope fits; otherwise it stays where it is and the
//! refusal is counted under the resource that was short.

use crate::core::{CoherenceResult, Destination, Message, MessageType, Resource};

use super::{CacheCoherenceController, Transaction, TransactionKind};

type Envelope = Vec<(Resource, u32)>;

impl CacheCoherenceController {
    pub(super) fn admit(&mut self) -> CoherenceResult<()> {
        while self.maf_stage.server_avail(self.now) {
            let admitted = self.try_wake_maf()?
                || self.try_cache_evict()?
                || self.try_dir_evict()?
                || self.try_reply()?
                || self.try_snoop()?
                || self.try_request()?
                || self.try_idle_work()?;
            if !admitted {
                break;
            }
        }
        Ok(())
    }

    /// Check `envelope`, counting a refusal against the first short resource.
    fn fits(&mut self, kind: TransactionKind, envelope: &Envelope) -> bool {
        let short = envelope
            .iter()
            .find(|(resource, n)| *n > 0 && !self.pool_has_space(*resource, *n));
        let Some((resource, n)) = short else {
            return true;
        };
        match resource {
            Resource::Maf => self.stats.maf_stalls += 1,
            Resource::CacheEvictBuffer | Resource::DirEvictBuffer => {
                self.stats.evict_buffer_stalls += 1
            }
            _ => self.stats.queue_stalls += 1,
        }
        log::trace!(
            "{}: {} not admitted, {:?} cannot take {}",
            self.config.name,
            kind,
            resource,
            n
        );
        false
    }

    fn start(
        &mut self,
        kind: TransactionKind,
        message: Message,
        envelope: &Envelope,
    ) -> CoherenceResult<Transaction> {
        let mut tx = Transaction::new(self.next_id(), kind, message, self.now);
        for (resource, n) in envelope {
            self.acquire(&mut tx, *resource, *n)?;
        }
        Ok(tx)
    }

    fn enter(&mut self, tx: Transaction) -> CoherenceResult<bool> {
        log::debug!("{}: admit {}", self.config.name, tx);
        self.stats.record_admission(tx.kind.name());
        self.maf_stage.enqueue(tx, 1, self.now)?;
        Ok(true)
    }

    fn request_envelope(&self, address: u64, with_maf: bool) -> Envelope {
        let k = self.protocol.max_snoops_per_request();
        let mut envelope = vec![
            (Resource::SnoopOut, k),
            (Resource::ReplyOut, 1),
            (Resource::RequestOut, 1),
            (
                Resource::DirEvictBuffer,
                self.directory.eviction_requirement(address),
            ),
        ];
        if with_maf {
            envelope.push((Resource::Maf, 1));
        }
        envelope
    }

    fn try_wake_maf(&mut self) -> CoherenceResult<bool> {
        let Some((_, entry)) = self.maf.peek_waking() else {
            return Ok(false);
        };
        let envelope = self.request_envelope(entry.address(), false);
        if !self.fits(TransactionKind::WakeMAF, &envelope) {
            return Ok(false);
        }
        let Some(handle) = self.maf.take_waking() else {
            return Ok(false);
        };
        let Some(message) = self.maf.get(handle).map(|e| e.request.clone()) else {
            return Ok(false);
        };
        let mut tx = self.start(TransactionKind::WakeMAF, message, &envelope)?;
        tx.maf = Some(handle);
        self.enter(tx)
    }

    fn try_cache_evict(&mut self) -> CoherenceResult<bool> {
        // Parked lines drain only once the buffer has no slot left to give.
        if !self.cache_eb.drain_due() {
            return Ok(false);
        }
        let envelope = vec![(Resource::SnoopOut, 1)];
        if !self.fits(TransactionKind::CacheEvict, &envelope) {
            return Ok(false);
        }
        let Some(entry) = self.cache_eb.begin_drain() else {
            return Ok(false);
        };
        let message = Message::new(entry.kind, entry.address, self.config.tile, Destination::Memory);
        let tx = self.start(TransactionKind::CacheEvict, message, &envelope)?;
        self.enter(tx)
    }

    fn try_dir_evict(&mut self) -> CoherenceResult<bool> {
        if !self.dir_eb.has_undrained() {
            return Ok(false);
        }
        let envelope = vec![(Resource::SnoopOut, 1)];
        if !self.fits(TransactionKind::DirEvict, &envelope) {
            return Ok(false);
        }
        let Some(victim) = self.dir_eb.begin_drain() else {
            return Ok(false);
        };
        let message = Message::new(
            MessageType::Invalidate,
            victim.address,
            self.config.tile,
            Destination::Multicast(victim.sharers),
        );
        let tx = self.start(TransactionKind::DirEvict, message, &envelope)?;
        self.enter(tx)
    }

    fn try_reply(&mut self) -> CoherenceResult<bool> {
        if self.reply_in.is_empty() {
            return Ok(false);
        }
        // A NAck may turn into a memory fill.
        let envelope = vec![
            (Resource::SnoopOut, 1),
            (Resource::ReplyOut, 1),
            (Resource::RequestOut, 1),
        ];
        if !self.fits(TransactionKind::Reply, &envelope) {
            return Ok(false);
        }
        let Some(message) = self.reply_in.dequeue() else {
            return Ok(false);
        };
        let tx = self.start(TransactionKind::Reply, message, &envelope)?;
        self.enter(tx)
    }

    fn try_snoop(&mut self) -> CoherenceResult<bool> {
        if self.snoop_in.is_empty() {
            return Ok(false);
        }
        // Eviction notices never hold a MAF entry; requests stalled on them may fill it.
        let envelope = vec![(Resource::SnoopOut, 1), (Resource::ReplyOut, 1)];
        if !self.fits(TransactionKind::Snoop, &envelope) {
            return Ok(false);
        }
        let Some(message) = self.snoop_in.dequeue() else {
            return Ok(false);
        };
        let tx = self.start(TransactionKind::Snoop, message, &envelope)?;
        self.enter(tx)
    }

    fn try_request(&mut self) -> CoherenceResult<bool> {
        let Some(address) = self.request_in.peek().map(|m| m.address) else {
            return Ok(false);
        };
        let envelope = self.request_envelope(address, true);
        if !self.fits(TransactionKind::Request, &envelope) {
            return Ok(false);
        }
        let Some(message) = self.request_in.dequeue() else {
            return Ok(false);
        };
        let tx = self.start(TransactionKind::Request, message, &envelope)?;
        self.enter(tx)
    }

    fn try_idle_work(&mut self) -> CoherenceResult<bool> {
        if self.idle_work_in_flight {
            return Ok(false);
        }
        let Some(&address) = self.idle_work.front() else {
            return Ok(false);
        };
        let envelope = vec![(Resource::SnoopOut, 1), (Resource::CacheEvictBuffer, 1)];
        if !self.fits(TransactionKind::IdleWork, &envelope) {
            return Ok(false);
        }
        self.idle_work.pop_front();
        // The eviction kind is decided at resolve from the line state at that time.
        let message = Message::new(
            MessageType::EvictClean,
            address,
            self.config.tile,
            Destination::Memory,
        );
        let tx = self.start(TransactionKind::IdleWork, message, &envelope)?;
        self.idle_work_in_flight = true;
        self.enter(tx)
    }
}
