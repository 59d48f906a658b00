// Controller statistics: counters the controller bumps while admitting, resolving and
// finalizing transactions, plus a Display report. Admission stalls are split by the
// resource that was missing (MAF, eviction buffer, output channel, pipeline server) so a
// run can tell which structure is the bottleneck. Receipt totals let tests check that
// every claim taken at admission was released or turned into occupancy.

//! Controller statistics.

use std::collections::HashMap;
use std::fmt;

/// Counters collected by a controller over its lifetime.
#[derive(Debug, Default, Clone)]
pub struct ControllerStats {
    /// Ticks executed.
    pub ticks: u64,

    /// Transactions admitted, by classification tag.
    pub admitted: HashMap<&'static str, u64>,

    /// Transactions finalized.
    pub finalized: u64,

    /// Resolved actions, by name.
    pub actions: HashMap<&'static str, u64>,

    /// Admissions refused because the MAF was full.
    pub maf_stalls: u64,

    /// Admissions refused for lack of eviction-buffer space.
    pub evict_buffer_stalls: u64,

    /// Admissions refused because an output channel could not hold the envelope.
    pub queue_stalls: u64,

    /// Cycles the tag stage waited on the data stage.
    pub data_stage_stalls: u64,

    /// Requests deferred behind another transaction for the same line.
    pub deferred_requests: u64,

    /// Snoop responses that matched no waiting transaction.
    pub stray_acks: u64,

    /// Cache eviction-buffer entries pulled back by a request.
    pub evict_buffer_reclaims: u64,

    /// Directory entries evicted to make room.
    pub directory_evictions: u64,

    pub receipts_acquired: u64,
    pub receipts_released: u64,
    pub receipts_transferred: u64,

    /// Messages sent, by output channel.
    pub snoops_sent: u64,
    pub replies_sent: u64,
    pub requests_sent: u64,
}

impl ControllerStats {
    pub fn record_admission(&mut self, tag: &'static str) {
        *self.admitted.entry(tag).or_default() += 1;
    }

    pub fn record_action(&mut self, action: &'static str) {
        *self.actions.entry(action).or_default() += 1;
    }

    pub fn admitted_count(&self, tag: &str) -> u64 {
        self.admitted.get(tag).copied().unwrap_or(0)
    }

    pub fn action_count(&self, action: &str) -> u64 {
        self.actions.get(action).copied().unwrap_or(0)
    }

    pub fn total_admitted(&self) -> u64 {
        self.admitted.values().sum()
    }

    /// True when every claim ever acquired has been released or transferred.
    pub fn receipts_balanced(&self) -> bool {
        self.receipts_acquired == self.receipts_released + self.receipts_transferred
    }
}

impl fmt::Display for ControllerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Directory Controller Statistics:")?;
        writeln!(f, "  Ticks: {}", self.ticks)?;
        writeln!(f, "  Transactions admitted: {}", self.total_admitted())?;
        writeln!(f, "  Transactions finalized: {}", self.finalized)?;
        writeln!(
            f,
            "  Messages sent: {} snoops, {} replies, {} requests",
            self.snoops_sent, self.replies_sent, self.requests_sent
        )?;
        writeln!(
            f,
            "  Admission stalls: {} MAF, {} eviction buffer, {} queue",
            self.maf_stalls, self.evict_buffer_stalls, self.queue_stalls
        )?;
        writeln!(f, "  Data stage stalls: {}", self.data_stage_stalls)?;
        writeln!(f, "  Deferred requests: {}", self.deferred_requests)?;
        writeln!(f, "  Directory evictions: {}", self.directory_evictions)?;
        writeln!(f, "  Evict buffer reclaims: {}", self.evict_buffer_reclaims)?;
        writeln!(f, "  Stray acks: {}", self.stray_acks)?;
        writeln!(
            f,
            "  Receipts: {} acquired, {} released, {} transferred",
            self.receipts_acquired, self.receipts_released, self.receipts_transferred
        )?;

        if !self.admitted.is_empty() {
            writeln!(f, "  Admissions by class:")?;
            let mut sorted: Vec<_> = self.admitted.iter().collect();
            sorted.sort_by_key(|(tag, count)| (std::cmp::Reverse(**count), **tag));
            for (tag, count) in sorted {
                writeln!(f, "    {}: {}", tag, count)?;
            }
        }

        if !self.actions.is_empty() {
            writeln!(f, "  Action breakdown:")?;
            let mut sorted: Vec<_> = self.actions.iter().collect();
            sorted.sort_by_key(|(action, count)| (std::cmp::Reverse(**count), **action));
            for (action, count) in sorted {
                writeln!(f, "    {}: {}", action, count)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_lists_actions() {
        let mut stats = ControllerStats::default();
        stats.record_admission("Request");
        stats.record_action("ReplyAndRemove");
        stats.record_action("ReplyAndRemove");
        let report = stats.to_string();
        assert!(report.contains("Transactions admitted: 1"));
        assert!(report.contains("ReplyAndRemove: 2"));
        assert_eq!(stats.action_count("ReplyAndRemove"), 2);
        assert_eq!(stats.action_count("Stall"), 0);
    }

    #[test]
    fn test_receipt_balance() {
        let mut stats = ControllerStats::default();
        stats.receipts_acquired = 5;
        stats.receipts_released = 3;
        stats.receipts_transferred = 2;
        assert!(stats.receipts_balanced());
    }
}
