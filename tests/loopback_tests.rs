//! End-to-end tests through the loopback private-cache model.
//!
//! These cover the paths that need private caches to answer snoops: directory
//! back-invalidation, tile-cache replacement and reclaim, and randomized workloads whose
//! final directory must match what the private caches actually hold.

use proptest::prelude::*;

use cmpdir::{
    Access, CacheCoherenceController, CacheState, ControllerConfig, Destination, DirectoryKind,
    Loopback, MessageType, NodeId,
};

const TILE: NodeId = 0;
const MAX_TICKS: u64 = 20_000;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn setup(config: ControllerConfig) -> (CacheCoherenceController, Loopback) {
    setup_with_snoop_delay(config, 0)
}

/// Like `setup`, with snoops reaching the private caches `snoop_delay` cycles late.
fn setup_with_snoop_delay(config: ControllerConfig, snoop_delay: u64) -> (CacheCoherenceController, Loopback) {
    init();
    let ctrl = CacheCoherenceController::new(config.with_tile(TILE)).unwrap();
    (ctrl, Loopback::new(TILE, 3).with_snoop_delay(snoop_delay))
}

/// Perform one access and wait for everything it causes to settle.
fn settle(ctrl: &mut CacheCoherenceController, net: &mut Loopback, node: NodeId, address: u64, write: bool) {
    let access = net.access(ctrl, node, address, write).unwrap();
    assert_ne!(access, Access::Busy);
    net.run_until_quiesced(ctrl, MAX_TICKS).unwrap();
}

fn sharers(ctrl: &CacheCoherenceController, address: u64) -> Vec<NodeId> {
    ctrl.directory()
        .find(address)
        .map(|entry| entry.sharers().to_list())
        .unwrap_or_default()
}

fn one_set(ways: usize) -> ControllerConfig {
    ControllerConfig::default().with_directory(DirectoryKind::SetAssociative { sets: 1, ways })
}

#[test]
fn test_directory_victim_is_back_invalidated() {
    let (mut ctrl, mut net) = setup(one_set(2));
    settle(&mut ctrl, &mut net, 1, 0x000, false);
    settle(&mut ctrl, &mut net, 2, 0x040, false);
    settle(&mut ctrl, &mut net, 3, 0x080, false);

    assert_eq!(ctrl.stats().directory_evictions, 1);
    assert!(ctrl.directory().find(0x000).is_none(), "LRU entry evicted");
    assert_eq!(net.copy(1, 0x000), None);
    assert_eq!(sharers(&ctrl, 0x040), vec![2]);
    assert_eq!(sharers(&ctrl, 0x080), vec![3]);

    let multicast = &net.multicasts()[0];
    assert_eq!(multicast.kind, MessageType::Invalidate);
    assert_eq!(multicast.address, 0x000);
    match multicast.destination {
        Destination::Multicast(nodes) => assert_eq!(nodes.to_list(), vec![1]),
        other => panic!("expected a multicast, got {:?}", other),
    }
    // The victim waited for its back-invalidation ack.
    assert_eq!(ctrl.stats().stray_acks, 0);
    assert!(ctrl.dir_evict_buffer().is_empty());
    assert!(ctrl.stats().receipts_balanced());
}

#[test]
fn test_exclusive_victim_keeps_data_in_tile() {
    let (mut ctrl, mut net) = setup(one_set(1));
    settle(&mut ctrl, &mut net, 1, 0x000, true);
    assert_eq!(ctrl.cache_state(0x000), CacheState::Exclusive);

    settle(&mut ctrl, &mut net, 2, 0x040, false);
    assert_eq!(ctrl.cache_state(0x000), CacheState::Modified);
    assert_eq!(net.copy(1, 0x000), None);

    // The line is served from the tile afterwards.
    settle(&mut ctrl, &mut net, 3, 0x000, false);
    assert_eq!(sharers(&ctrl, 0x000), vec![3]);
    assert_eq!(ctrl.stats().directory_evictions, 2);
}

#[test]
fn test_replacement_is_parked_and_reclaimed() {
    let (mut ctrl, mut net) = setup(ControllerConfig::default());
    settle(&mut ctrl, &mut net, 2, 0x400, true);
    assert_eq!(ctrl.cache_state(0x400), CacheState::Exclusive);

    ctrl.schedule_replacement(0x400);
    net.run_until_quiesced(&mut ctrl, MAX_TICKS).unwrap();
    assert_eq!(ctrl.cache_state(0x400), CacheState::Invalid);
    assert_eq!(ctrl.cache_evict_buffer().len(), 1);
    assert!(net.memory_traffic().iter().all(|m| !m.kind.is_eviction()));

    settle(&mut ctrl, &mut net, 5, 0x400, false);
    assert_eq!(ctrl.stats().evict_buffer_reclaims, 1);
    assert!(ctrl.cache_evict_buffer().is_empty());
    assert_eq!(ctrl.cache_state(0x400), CacheState::Shared);
    assert_eq!(sharers(&ctrl, 0x400), vec![2, 5]);
    assert_eq!(net.copy(2, 0x400).map(|c| c.writable), Some(false));
}

#[test]
fn test_owner_eviction_reclaims_parked_line() {
    let (mut ctrl, mut net) = setup(ControllerConfig::default());
    settle(&mut ctrl, &mut net, 4, 0x480, true);
    ctrl.schedule_replacement(0x480);
    net.run_until_quiesced(&mut ctrl, MAX_TICKS).unwrap();

    assert_eq!(net.evict(4, 0x480), Some(MessageType::EvictDirty));
    net.run_until_quiesced(&mut ctrl, MAX_TICKS).unwrap();
    assert_eq!(ctrl.cache_state(0x480), CacheState::Modified);
    assert!(ctrl.cache_evict_buffer().is_empty());
    assert!(ctrl.directory().find(0x480).is_none());

    settle(&mut ctrl, &mut net, 6, 0x480, false);
    assert_eq!(sharers(&ctrl, 0x480), vec![6]);
}

#[test]
fn test_full_evict_buffer_drains_to_memory() {
    let (mut ctrl, mut net) = setup(ControllerConfig::default().with_evict_buffers(1, 4));
    settle(&mut ctrl, &mut net, 1, 0x800, false);

    ctrl.schedule_replacement(0x800);
    net.run_until_quiesced(&mut ctrl, MAX_TICKS).unwrap();
    let writebacks: Vec<_> = net
        .memory_traffic()
        .iter()
        .filter(|m| m.kind == MessageType::EvictClean)
        .collect();
    assert_eq!(writebacks.len(), 1);
    assert_eq!(writebacks[0].address, 0x800);
    assert!(ctrl.cache_evict_buffer().is_empty());
    assert_eq!(ctrl.stats().admitted_count("CacheEvict"), 1);

    // The line is fetched back from its remaining sharer.
    settle(&mut ctrl, &mut net, 2, 0x800, false);
    assert_eq!(ctrl.stats().action_count("ForwardAndWaitAck"), 1);
    assert_eq!(sharers(&ctrl, 0x800), vec![1, 2]);
}

#[test]
fn test_downgrade_after_silent_eviction_is_nacked() {
    let (mut ctrl, mut net) = setup(ControllerConfig::default());
    settle(&mut ctrl, &mut net, 1, 0x900, true);

    // The eviction notice is still on its way when the downgrade arrives.
    net.evict(1, 0x900);
    assert_eq!(net.access(&mut ctrl, 2, 0x900, false).unwrap(), Access::Issued(MessageType::ReadReq));
    net.run_until_quiesced(&mut ctrl, MAX_TICKS).unwrap();

    assert_eq!(sharers(&ctrl, 0x900), vec![2]);
    assert_eq!(net.holders(0x900), vec![2]);
    assert!(ctrl.stats().receipts_balanced());
}

#[test]
fn test_delayed_invalidate_crosses_eviction_notice() {
    let (mut ctrl, mut net) = setup_with_snoop_delay(ControllerConfig::default(), 20);
    settle(&mut ctrl, &mut net, 1, 0x100, false);
    settle(&mut ctrl, &mut net, 2, 0x100, false);

    net.access(&mut ctrl, 3, 0x100, true).unwrap();
    for _ in 0..5 {
        net.step(&mut ctrl).unwrap();
    }
    // Node 1 still holds the line: the invalidate has not reached it yet.
    assert_eq!(net.evict(1, 0x100), Some(MessageType::EvictClean));
    net.run_until_quiesced(&mut ctrl, MAX_TICKS).unwrap();

    assert_eq!(net.holders(0x100), vec![3]);
    assert_eq!(sharers(&ctrl, 0x100), vec![3]);
    assert!(ctrl.stats().receipts_balanced());
}

#[test]
fn test_delayed_back_invalidate_holds_victim() {
    let (mut ctrl, mut net) = setup_with_snoop_delay(one_set(1), 30);
    settle(&mut ctrl, &mut net, 1, 0x000, false);

    net.access(&mut ctrl, 2, 0x040, false).unwrap();
    net.access(&mut ctrl, 3, 0x000, true).unwrap();
    for _ in 0..15 {
        net.step(&mut ctrl).unwrap();
    }
    assert_eq!(net.copy(3, 0x000), None, "write waits for the victim's ack");
    assert!(!ctrl.dir_evict_buffer().is_empty());

    net.run_until_quiesced(&mut ctrl, MAX_TICKS).unwrap();
    assert_eq!(net.holders(0x000), vec![3]);
    assert_eq!(ctrl.stats().stray_acks, 0);
    assert!(ctrl.dir_evict_buffer().is_empty());
    assert!(ctrl.stats().receipts_balanced());
}

#[test]
fn test_restored_directory_matches_private_caches() {
    let (mut ctrl, mut net) = setup(ControllerConfig::default());
    settle(&mut ctrl, &mut net, 1, 0xa00, false);
    settle(&mut ctrl, &mut net, 2, 0xa00, false);
    let mut bytes = Vec::new();
    ctrl.save_directory(&mut bytes).unwrap();

    let (mut fresh, mut fresh_net) = setup(ControllerConfig::default());
    fresh.load_directory(bytes.as_slice()).unwrap();
    assert_eq!(fresh_net.adopt_directory(fresh.directory()), 2);
    assert_eq!(fresh_net.holders(0xa00), vec![1, 2]);

    // A write has to invalidate both restored copies.
    settle(&mut fresh, &mut fresh_net, 3, 0xa00, true);
    assert_eq!(fresh_net.holders(0xa00), vec![3]);
    assert_eq!(sharers(&fresh, 0xa00), vec![3]);
}

/// One step of a generated workload.
#[derive(Debug, Clone)]
enum Op {
    Access { node: NodeId, line: u64, write: bool },
    Evict { node: NodeId, line: u64 },
    Replace { line: u64 },
}

fn op_strategy(nodes: NodeId, lines: u64) -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (1..=nodes, 0..lines, any::<bool>())
            .prop_map(|(node, line, write)| Op::Access { node, line, write }),
        2 => (1..=nodes, 0..lines).prop_map(|(node, line)| Op::Evict { node, line }),
        1 => (0..lines).prop_map(|line| Op::Replace { line }),
    ]
}

fn run_workload(
    ctrl: &mut CacheCoherenceController,
    net: &mut Loopback,
    ops: &[Op],
) -> Result<(), TestCaseError> {
    let block = ctrl.config().block_size;
    for op in ops {
        match *op {
            Op::Access { node, line, write } => {
                let mut attempts = 0;
                while net.access(ctrl, node, line * block, write).unwrap() == Access::Busy {
                    net.step(ctrl).unwrap();
                    attempts += 1;
                    prop_assert!(attempts < MAX_TICKS, "access never accepted");
                }
            }
            Op::Evict { node, line } => {
                net.evict(node, line * block);
            }
            Op::Replace { line } => ctrl.schedule_replacement(line * block),
        }
        net.step(ctrl).unwrap();
    }
    net.run_until_quiesced(ctrl, MAX_TICKS).unwrap();
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_random_workload_keeps_directory_exact(
        ops in prop::collection::vec(op_strategy(6, 6), 1..150),
        snoop_delay in 0u64..6,
    ) {
        let config = ControllerConfig::default().with_maf_size(8);
        let (mut ctrl, mut net) = setup_with_snoop_delay(config, snoop_delay);
        run_workload(&mut ctrl, &mut net, &ops)?;

        prop_assert!(ctrl.stats().receipts_balanced());
        prop_assert!(ctrl.maf().is_empty());
        let block = ctrl.config().block_size;
        for line in 0..6 {
            let address = line * block;
            prop_assert_eq!(sharers(&ctrl, address), net.holders(address), "line {:#x}", address);
        }
    }

    #[test]
    fn test_random_workload_with_bounded_directory_drains(
        ops in prop::collection::vec(op_strategy(4, 8), 1..100),
        snoop_delay in 0u64..6,
    ) {
        let config = ControllerConfig::default()
            .with_directory(DirectoryKind::SetAssociative { sets: 2, ways: 2 })
            .with_queue_size(4);
        let (mut ctrl, mut net) = setup_with_snoop_delay(config, snoop_delay);
        run_workload(&mut ctrl, &mut net, &ops)?;

        prop_assert!(ctrl.stats().receipts_balanced());
        prop_assert!(ctrl.maf().is_empty());
        prop_assert!(ctrl.dir_evict_buffer().is_empty());
        prop_assert!(ctrl.directory().len() <= 4);
        let block = ctrl.config().block_size;
        for line in 0..8 {
            let address = line * block;
            prop_assert_eq!(sharers(&ctrl, address), net.holders(address), "line {:#x}", address);
        }
    }
}
