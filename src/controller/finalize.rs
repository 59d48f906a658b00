//! Complete phase and finalize.
//!
//! Finalize is the only place messages leave the controller. It turns the claims the
//! transaction kept into channel occupancy, applies the MAF effect of the action, frees
//! eviction-buffer slots, drops directory pins and checks that nothing is left on the
//! receipt.

use crate::core::{CoherenceError, CoherenceResult, Resource};
use crate::protocol::MafEffect;

use super::{CacheCoherenceController, Transaction, TransactionKind};

impl CacheCoherenceController {
    pub(super) fn complete(&mut self) -> CoherenceResult<()> {
        while self.data_stage.ready(self.now) {
            let Some(tx) = self.data_stage.dequeue() else {
                break;
            };
            self.finalize(tx)?;
        }
        while self.tag_stage.ready(self.now) {
            let needs_data = self.tag_stage.peek().is_some_and(|tx| tx.requires_data);
            if needs_data && !self.config.transmit_after_tag {
                if !self.data_stage.server_avail(self.now) {
                    self.tag_stage.stall();
                    self.stats.data_stage_stalls += 1;
                    break;
                }
                let Some(tx) = self.tag_stage.dequeue() else {
                    break;
                };
                self.data_stage.enqueue(tx, 1, self.now)?;
            } else {
                let Some(tx) = self.tag_stage.dequeue() else {
                    break;
                };
                self.finalize(tx)?;
            }
        }
        Ok(())
    }

    pub(super) fn finalize(&mut self, mut tx: Transaction) -> CoherenceResult<()> {
        let address = tx.message.address;

        for snoop in std::mem::take(&mut tx.snoops) {
            self.transfer(&mut tx, Resource::SnoopOut)?;
            self.snoop_out.enqueue_reserved(snoop)?;
            self.stats.snoops_sent += 1;
        }
        if let Some(reply) = tx.reply.take() {
            self.transfer(&mut tx, Resource::ReplyOut)?;
            self.reply_out.enqueue_reserved(reply)?;
            self.stats.replies_sent += 1;
        }
        if let Some(forward) = tx.forward.take() {
            self.transfer(&mut tx, Resource::RequestOut)?;
            self.request_out.enqueue_reserved(forward)?;
            self.stats.requests_sent += 1;
        }

        let effect = tx.action.contract().maf;
        if effect != MafEffect::None {
            let handle = tx.maf.ok_or_else(|| CoherenceError::UndischargedObligation {
                id: tx.id,
                detail: format!("{} without a MAF entry", tx.action),
            })?;
            match effect {
                MafEffect::Remove | MafEffect::RemoveAndWake => {
                    let entry = self.maf.remove(handle)?;
                    if let Some(pin) = entry.pin {
                        self.directory.release(pin);
                    }
                    if effect == MafEffect::RemoveAndWake {
                        self.maf.wake_waiters(address);
                    }
                    self.maf.wake_set_waiter();
                }
                MafEffect::WakeAfterEvict => self.maf.wake_after_evict(handle)?,
                MafEffect::None => {}
            }
        }

        if tx.kind == TransactionKind::CacheEvict {
            self.cache_eb.finish_drain(address)?;
        }

        if let Some(pin) = tx.entry.take() {
            self.directory.release(pin);
            self.maf.wake_set_waiter();
        }

        for (resource, held) in tx.receipts.outstanding() {
            log::warn!(
                "{}: tx#{} finalized holding {} {:?} claims",
                self.config.name,
                tx.id,
                held,
                resource
            );
            self.release(&mut tx, resource, held)?;
        }
        if !tx.receipts.is_settled() {
            return Err(CoherenceError::UndischargedObligation {
                id: tx.id,
                detail: tx.receipts.to_string(),
            });
        }
        log::trace!(
            "{}: finalized {} after {} cycles",
            self.config.name,
            tx,
            self.now - tx.admitted_at
        );
        self.stats.finalized += 1;
        Ok(())
    }
}
