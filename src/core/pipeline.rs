// Timed pipeline stage used for the MAF, tag-array and data-array stages of the
// controller. A stage has a fixed number of non-blocking servers, an issue latency that
// keeps a server busy after each admission, and a completion latency after which the item
// may leave. Items leave strictly in admission order: the head blocks everything behind
// it even if a later item was admitted with a shorter repeat count. An item admitted with
// a repeat count occupies that many consecutive server issue slots and its completion is
// scaled by the same factor, which is how multi-lookup transactions are modeled.

//! Multi-server timed pipeline stage.

use std::collections::VecDeque;

use super::error::{CoherenceError, CoherenceResult};
use super::message::Cycle;

/// Timing parameters for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTiming {
    pub servers: usize,
    pub issue_latency: u64,
    pub latency: u64,
}

impl StageTiming {
    pub const fn new(servers: usize, issue_latency: u64, latency: u64) -> Self {
        Self {
            servers,
            issue_latency,
            latency,
        }
    }
}

struct Slot<T> {
    item: T,
    complete_at: Cycle,
}

/// Pipeline stage with `servers` parallel servers.
pub struct TimedPipelineStage<T> {
    name: String,
    timing: StageTiming,
    /// Cycle at which each server can accept the next item, earliest first.
    server_ready: VecDeque<Cycle>,
    queue: VecDeque<Slot<T>>,
    admitted: u64,
    stalls: u64,
}

impl<T> TimedPipelineStage<T> {
    pub fn new(name: impl Into<String>, timing: StageTiming) -> CoherenceResult<Self> {
        let name = name.into();
        if timing.servers == 0 || timing.issue_latency == 0 {
            return Err(CoherenceError::Config {
                reason: format!("{name}: pipeline needs at least one server and a non-zero issue latency"),
            });
        }
        Ok(Self {
            name,
            timing,
            server_ready: std::iter::repeat(0).take(timing.servers).collect(),
            queue: VecDeque::new(),
            admitted: 0,
            stalls: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timing(&self) -> StageTiming {
        self.timing
    }

    /// True if a server can accept an item at `now`.
    pub fn server_avail(&self, now: Cycle) -> bool {
        self.server_ready.front().is_some_and(|ready| *ready <= now)
    }

    /// Admit `item`, occupying `repeat` issue slots.
    pub fn enqueue(&mut self, item: T, repeat: u32, now: Cycle) -> CoherenceResult<()> {
        if !self.server_avail(now) {
            return Err(CoherenceError::PipelineBusy {
                stage: self.name.clone(),
                now,
            });
        }
        let repeat = u64::from(repeat.max(1));
        for i in 0..repeat {
            self.server_ready.pop_front();
            self.server_ready
                .push_back(now + self.timing.issue_latency * (i + 1));
        }
        self.queue.push_back(Slot {
            item,
            complete_at: now + self.timing.latency * repeat,
        });
        self.admitted += 1;
        Ok(())
    }

    /// True when the head item has finished.
    pub fn ready(&self, now: Cycle) -> bool {
        self.queue.front().is_some_and(|slot| slot.complete_at <= now)
    }

    pub fn peek(&self) -> Option<&T> {
        self.queue.front().map(|slot| &slot.item)
    }

    pub fn dequeue(&mut self) -> Option<T> {
        self.queue.pop_front().map(|slot| slot.item)
    }

    /// Hold every server for one extra cycle.
    pub fn stall(&mut self) {
        for ready in self.server_ready.iter_mut() {
            *ready += 1;
        }
        self.stalls += 1;
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn admitted(&self) -> u64 {
        self.admitted
    }

    pub fn stalls(&self) -> u64 {
        self.stalls
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.queue.iter().map(|slot| &slot.item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_server_latency() {
        let mut stage = TimedPipelineStage::new("tag", StageTiming::new(1, 1, 3)).unwrap();
        stage.enqueue("a", 1, 0).unwrap();
        for now in 0..3 {
            assert!(!stage.ready(now));
        }
        assert!(stage.ready(3));
        assert!(matches!(
            stage.enqueue("b", 1, 0),
            Err(CoherenceError::PipelineBusy { now: 0, .. })
        ));
        assert!(stage.server_avail(1));
    }

    #[test]
    fn test_in_order_completion() {
        let mut stage = TimedPipelineStage::new("maf", StageTiming::new(2, 1, 2)).unwrap();
        stage.enqueue(1, 2, 0).unwrap();
        stage.enqueue(2, 1, 1).unwrap();
        // The second item completes at 3, the first at 4; the head blocks it.
        assert!(!stage.ready(3));
        assert!(stage.ready(4));
        assert_eq!(stage.dequeue(), Some(1));
        assert!(stage.ready(4));
        assert_eq!(stage.dequeue(), Some(2));
    }

    #[test]
    fn test_repeat_occupies_servers() {
        let mut stage = TimedPipelineStage::new("tag", StageTiming::new(2, 2, 1)).unwrap();
        stage.enqueue((), 2, 0).unwrap();
        // Both servers are busy until cycles 2 and 4.
        assert!(!stage.server_avail(1));
        assert!(stage.server_avail(2));
    }

    #[test]
    fn test_stall_delays_servers() {
        let mut stage = TimedPipelineStage::new("tag", StageTiming::new(1, 1, 0)).unwrap();
        stage.enqueue((), 1, 0).unwrap();
        stage.stall();
        assert!(!stage.server_avail(1));
        assert!(stage.server_avail(2));
        assert_eq!(stage.stalls(), 1);
    }

    #[test]
    fn test_rejects_degenerate_timing() {
        assert!(TimedPipelineStage::<()>::new("x", StageTiming::new(0, 1, 1)).is_err());
        assert!(TimedPipelineStage::<()>::new("x", StageTiming::new(1, 0, 1)).is_err());
    }
}
