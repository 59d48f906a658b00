//! Controller configuration.
//!
//! Everything a controller needs at construction: channel and buffer sizes, the
//! three pipeline stage timings, and the directory storage strategy. Built with
//! `Default` plus `with_*` methods and checked by [`ControllerConfig::validate`].

use crate::core::{CoherenceError, CoherenceResult, NodeId, StageTiming};
use crate::directory::{DirectoryKind, MAX_NUM_SHARERS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Prefix for log lines and channel names.
    pub name: String,
    /// Node id the tile uses as the source of messages it generates.
    pub tile: NodeId,
    /// Private caches that may become sharers.
    pub num_nodes: usize,
    /// Capacity of each of the six channels.
    pub queue_size: usize,
    pub maf_size: usize,
    pub cache_evict_buffer_size: usize,
    pub dir_evict_buffer_size: usize,
    pub block_size: u64,
    pub maf_timing: StageTiming,
    pub tag_timing: StageTiming,
    pub data_timing: StageTiming,
    pub directory: DirectoryKind,
    /// Finalize data-carrying transactions after the tag stage instead of
    /// routing them through the data stage.
    pub transmit_after_tag: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "dir0".to_string(),
            tile: 0,
            num_nodes: 16,
            queue_size: 16,
            maf_size: 32,
            cache_evict_buffer_size: 8,
            dir_evict_buffer_size: 4,
            block_size: 64,
            maf_timing: StageTiming::new(1, 1, 1),
            tag_timing: StageTiming::new(2, 1, 3),
            data_timing: StageTiming::new(1, 2, 6),
            directory: DirectoryKind::Infinite,
            transmit_after_tag: false,
        }
    }
}

impl ControllerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_tile(mut self, tile: NodeId) -> Self {
        self.tile = tile;
        self
    }

    pub fn with_num_nodes(mut self, num_nodes: usize) -> Self {
        self.num_nodes = num_nodes;
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn with_maf_size(mut self, maf_size: usize) -> Self {
        self.maf_size = maf_size;
        self
    }

    pub fn with_evict_buffers(mut self, cache: usize, directory: usize) -> Self {
        self.cache_evict_buffer_size = cache;
        self.dir_evict_buffer_size = directory;
        self
    }

    pub fn with_directory(mut self, directory: DirectoryKind) -> Self {
        self.directory = directory;
        self
    }

    pub fn with_timings(mut self, maf: StageTiming, tag: StageTiming, data: StageTiming) -> Self {
        self.maf_timing = maf;
        self.tag_timing = tag;
        self.data_timing = data;
        self
    }

    pub fn with_transmit_after_tag(mut self, enabled: bool) -> Self {
        self.transmit_after_tag = enabled;
        self
    }

    /// Reject configurations the controller cannot run with. `max_snoops` is the
    /// protocol's per-request snoop bound, which the snoop channel must hold.
    pub fn validate(&self, max_snoops: u32) -> CoherenceResult<()> {
        let fail = |reason: String| Err(CoherenceError::Config { reason });
        if self.num_nodes == 0 || self.num_nodes > MAX_NUM_SHARERS {
            return fail(format!(
                "{}: num_nodes must be in 1..={MAX_NUM_SHARERS}, got {}",
                self.name, self.num_nodes
            ));
        }
        if self.queue_size < (max_snoops as usize).max(1) {
            return fail(format!(
                "{}: queue_size {} cannot hold {max_snoops} snoops",
                self.name, self.queue_size
            ));
        }
        if self.maf_size == 0 {
            return fail(format!("{}: maf_size must be non-zero", self.name));
        }
        if self.cache_evict_buffer_size == 0 || self.dir_evict_buffer_size == 0 {
            return fail(format!("{}: eviction buffers must be non-empty", self.name));
        }
        if !self.block_size.is_power_of_two() {
            return fail(format!(
                "{}: block size {} is not a power of two",
                self.name, self.block_size
            ));
        }
        for (stage, timing) in [
            ("maf", self.maf_timing),
            ("tag", self.tag_timing),
            ("data", self.data_timing),
        ] {
            if timing.servers == 0 || timing.issue_latency == 0 {
                return fail(format!(
                    "{}: {stage} stage needs a server and a non-zero issue latency",
                    self.name
                ));
            }
        }
        Ok(())
    }
}
