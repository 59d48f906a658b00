// Bounded FIFO with reservation accounting, the building block for every channel and
// buffer the controller touches. The queue tracks `used` (items present) and `reserved`
// (items present plus claims for items that will be enqueued later) against a fixed
// capacity and keeps `used <= reserved <= capacity` at all times. Admission reserves the
// worst case a transaction could emit; finalize either enqueues against that reservation
// (enqueue_reserved) or hands the unused part back (unreserve). Every mutation checks the
// invariant first and leaves the queue untouched on failure.

//! Reservation-aware bounded queue and the channel contract built on it.

use std::collections::VecDeque;

use super::error::{CoherenceError, CoherenceResult};

/// Contract the controller expects from every input and output channel.
pub trait Channel<T> {
    fn is_empty(&self) -> bool;
    fn peek(&self) -> Option<&T>;
    fn dequeue(&mut self) -> Option<T>;
    fn has_space(&self, n: usize) -> bool;
    fn outstanding_reservations(&self) -> usize;
    fn reserve(&mut self, n: usize) -> CoherenceResult<()>;
    fn unreserve(&mut self, n: usize) -> CoherenceResult<()>;
    fn enqueue(&mut self, item: T) -> CoherenceResult<()>;
}

/// Bounded FIFO with reservation accounting.
#[derive(Debug, Clone)]
pub struct ReservedQueue<T> {
    name: String,
    items: VecDeque<T>,
    capacity: usize,
    reserved: usize,
}

impl<T> ReservedQueue<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            items: VecDeque::with_capacity(capacity),
            capacity,
            reserved: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items currently present.
    pub fn used(&self) -> usize {
        self.items.len()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Items present plus outstanding claims.
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// True when no further item or claim fits.
    pub fn is_full(&self) -> bool {
        self.reserved >= self.capacity
    }

    pub fn has_space(&self, n: usize) -> bool {
        self.reserved + n <= self.capacity
    }

    /// Claims held beyond the items already present.
    pub fn outstanding_reservations(&self) -> usize {
        self.reserved - self.items.len()
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Append without a prior claim. Counts against both used and reserved.
    pub fn enqueue(&mut self, item: T) -> CoherenceResult<()> {
        self.check("enqueue", self.items.len() + 1, self.reserved + 1)?;
        self.items.push_back(item);
        self.reserved += 1;
        Ok(())
    }

    /// Append against a claim taken earlier with `reserve`.
    pub fn enqueue_reserved(&mut self, item: T) -> CoherenceResult<()> {
        if self.outstanding_reservations() == 0 {
            return Err(self.violation("enqueue_reserved", self.items.len() + 1, self.reserved));
        }
        self.items.push_back(item);
        Ok(())
    }

    pub fn dequeue(&mut self) -> Option<T> {
        let item = self.items.pop_front()?;
        self.reserved -= 1;
        Some(item)
    }

    /// Remove the first item matching `pred`, releasing its slot.
    pub fn remove_first(&mut self, pred: impl Fn(&T) -> bool) -> Option<T> {
        let pos = self.items.iter().position(pred)?;
        let item = self.items.remove(pos)?;
        self.reserved -= 1;
        Some(item)
    }

    pub fn find(&self, pred: impl Fn(&T) -> bool) -> Option<&T> {
        self.items.iter().find(|item| pred(item))
    }

    pub fn find_mut(&mut self, pred: impl Fn(&T) -> bool) -> Option<&mut T> {
        self.items.iter_mut().find(|item| pred(item))
    }

    pub fn reserve(&mut self, n: usize) -> CoherenceResult<()> {
        self.check("reserve", self.items.len(), self.reserved + n)?;
        self.reserved += n;
        Ok(())
    }

    pub fn unreserve(&mut self, n: usize) -> CoherenceResult<()> {
        if n > self.reserved {
            return Err(self.violation("unreserve", self.items.len(), 0));
        }
        self.check("unreserve", self.items.len(), self.reserved - n)?;
        self.reserved -= n;
        Ok(())
    }

    fn check(&self, operation: &'static str, used: usize, reserved: usize) -> CoherenceResult<()> {
        if used <= reserved && reserved <= self.capacity {
            Ok(())
        } else {
            Err(self.violation(operation, used, reserved))
        }
    }

    fn violation(&self, operation: &'static str, used: usize, reserved: usize) -> CoherenceError {
        CoherenceError::CapacityInvariant {
            queue: self.name.clone(),
            operation,
            used,
            reserved,
            capacity: self.capacity,
        }
    }
}

impl<T> Channel<T> for ReservedQueue<T> {
    fn is_empty(&self) -> bool {
        ReservedQueue::is_empty(self)
    }

    fn peek(&self) -> Option<&T> {
        ReservedQueue::peek(self)
    }

    fn dequeue(&mut self) -> Option<T> {
        ReservedQueue::dequeue(self)
    }

    fn has_space(&self, n: usize) -> bool {
        ReservedQueue::has_space(self, n)
    }

    fn outstanding_reservations(&self) -> usize {
        ReservedQueue::outstanding_reservations(self)
    }

    fn reserve(&mut self, n: usize) -> CoherenceResult<()> {
        ReservedQueue::reserve(self, n)
    }

    fn unreserve(&mut self, n: usize) -> CoherenceResult<()> {
        ReservedQueue::unreserve(self, n)
    }

    fn enqueue(&mut self, item: T) -> CoherenceResult<()> {
        ReservedQueue::enqueue(self, item)
    }
}
