// Reservation receipts. Every transaction admitted into the controller claims its
// worst-case needs from the bounded structures it may touch (output channels, the miss
// address file, the two eviction buffers). The claims live in a ReceiptSet carried by the
// transaction: handlers shrink it when they know the real requirement, and finalize
// converts what is left into channel occupancy. A receipt must end empty; one dropped
// while still holding claims is logged as a leak, and the controller's finalize reports it
// as an undischarged obligation before that can happen. The set also keeps running totals
// so statistics can check that releases and transfers add up to acquisitions.

//! Scoped reservation receipts.

use std::fmt;

use super::error::{CoherenceError, CoherenceResult};

/// Bounded resources a transaction can hold claims on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resource {
    SnoopOut,
    ReplyOut,
    RequestOut,
    Maf,
    CacheEvictBuffer,
    DirEvictBuffer,
}

impl Resource {
    pub const ALL: [Resource; 6] = [
        Resource::SnoopOut,
        Resource::ReplyOut,
        Resource::RequestOut,
        Resource::Maf,
        Resource::CacheEvictBuffer,
        Resource::DirEvictBuffer,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Claims held against a single resource.
#[derive(Debug, Default)]
#[must_use]
pub struct ReservationReceipt {
    held: u32,
}

impl ReservationReceipt {
    pub fn held(&self) -> u32 {
        self.held
    }

    fn take(&mut self, resource: Resource, n: u32) -> CoherenceResult<()> {
        if n > self.held {
            return Err(CoherenceError::ReservationImbalance {
                resource,
                held: self.held,
                requested: n,
            });
        }
        self.held -= n;
        Ok(())
    }
}

/// Per-transaction set of receipts, one slot per resource.
#[derive(Debug, Default)]
pub struct ReceiptSet {
    receipts: [ReservationReceipt; 6],
    acquired: u32,
    released: u32,
    transferred: u32,
}

impl ReceiptSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn held(&self, resource: Resource) -> u32 {
        self.receipts[resource.index()].held
    }

    /// Record `n` claims the caller has already taken from the pool.
    pub fn acquire(&mut self, resource: Resource, n: u32) {
        self.receipts[resource.index()].held += n;
        self.acquired += n;
    }

    /// Drop `n` claims; the caller returns them to the pool.
    pub fn release(&mut self, resource: Resource, n: u32) -> CoherenceResult<()> {
        self.receipts[resource.index()].take(resource, n)?;
        self.released += n;
        Ok(())
    }

    /// Turn `n` claims into occupancy of the pool.
    pub fn transfer(&mut self, resource: Resource, n: u32) -> CoherenceResult<()> {
        self.receipts[resource.index()].take(resource, n)?;
        self.transferred += n;
        Ok(())
    }

    /// Release everything above `keep`, returning how many claims were dropped.
    pub fn refund_above(&mut self, resource: Resource, keep: u32) -> CoherenceResult<u32> {
        let held = self.held(resource);
        if keep > held {
            return Err(CoherenceError::ReservationImbalance {
                resource,
                held,
                requested: keep,
            });
        }
        let refund = held - keep;
        self.release(resource, refund)?;
        Ok(refund)
    }

    pub fn is_settled(&self) -> bool {
        self.receipts.iter().all(|r| r.held == 0)
    }

    /// Resources still holding claims.
    pub fn outstanding(&self) -> Vec<(Resource, u32)> {
        Resource::ALL
            .iter()
            .filter_map(|r| {
                let held = self.held(*r);
                (held > 0).then_some((*r, held))
            })
            .collect()
    }

    pub fn acquired(&self) -> u32 {
        self.acquired
    }

    pub fn released(&self) -> u32 {
        self.released
    }

    pub fn transferred(&self) -> u32 {
        self.transferred
    }
}

impl fmt::Display for ReceiptSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outstanding = self.outstanding();
        if outstanding.is_empty() {
            return write!(f, "settled");
        }
        for (i, (resource, held)) in outstanding.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{resource:?}={held}")?;
        }
        Ok(())
    }
}

impl Drop for ReceiptSet {
    fn drop(&mut self) {
        if !self.is_settled() && !std::thread::panicking() {
            log::error!("Receipt set dropped while holding claims: {self}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_transfer() {
        let mut set = ReceiptSet::new();
        set.acquire(Resource::SnoopOut, 2);
        set.acquire(Resource::ReplyOut, 1);
        set.transfer(Resource::SnoopOut, 1).unwrap();
        assert_eq!(set.refund_above(Resource::SnoopOut, 0).unwrap(), 1);
        set.release(Resource::ReplyOut, 1).unwrap();
        assert!(set.is_settled());
        assert_eq!(set.acquired(), set.released() + set.transferred());
    }

    #[test]
    fn test_over_release_is_imbalance() {
        let mut set = ReceiptSet::new();
        set.acquire(Resource::Maf, 1);
        let err = set.release(Resource::Maf, 2).unwrap_err();
        assert!(matches!(
            err,
            CoherenceError::ReservationImbalance { resource: Resource::Maf, held: 1, requested: 2 }
        ));
        set.release(Resource::Maf, 1).unwrap();
    }

    #[test]
    fn test_outstanding_listing() {
        let mut set = ReceiptSet::new();
        set.acquire(Resource::DirEvictBuffer, 1);
        assert_eq!(set.outstanding(), vec![(Resource::DirEvictBuffer, 1)]);
        assert_eq!(set.to_string(), "DirEvictBuffer=1");
        set.release(Resource::DirEvictBuffer, 1).unwrap();
        assert_eq!(set.to_string(), "settled");
    }
}
