//! End-to-end allocation scenarios: the small-object heap's block churn
//! under repeated allocate/release cycles, and overflow into the spill
//! allocator once the heap itself is exhausted.

use precise_gc::{GcConfig, Manager, RootCell};

#[test]
fn block_count_never_exceeds_initial_budget_across_churn_cycles() {
    let mut mgr = Manager::init(GcConfig::default(), None).unwrap();
    let initial_blocks = mgr.info(0).blocks_total;

    for cycle in 0..10 {
        let snap = mgr.enter_scope();
        for _ in 0..4096 {
            mgr.blob(16).unwrap();
        }
        mgr.exit_scope(snap);

        // Volume/block thresholds may already have forced one or more
        // collections partway through the loop above; this call reclaims
        // whatever is left over, which can legitimately be zero.
        mgr.collect_now();

        let info = mgr.info(0);
        assert!(
            info.blocks_total <= initial_blocks,
            "cycle {cycle}: heap grew past its initial block budget ({} > {})",
            info.blocks_total,
            initial_blocks,
        );
        assert_eq!(
            info.blocks_in_use, 0,
            "cycle {cycle}: every blob was unrooted and should have been reclaimed"
        );
    }
}

#[test]
fn fixed_size_allocation_spills_once_every_block_is_full() {
    const BLOCK_SIZE: usize = 4096;

    let mut mgr = Manager::init(GcConfig::default().with_num_blocks(2), None).unwrap();
    // One slot per block, so a third allocation must exhaust the
    // two-block heap on its very first rotation.
    let page = mgr.register_type("page", BLOCK_SIZE, None, None, None).unwrap();

    let snap = mgr.enter_scope();
    let mut storage = [0usize; 3];
    let mut roots = Vec::new();
    for slot in storage.iter_mut() {
        let addr = mgr.alloc(page).unwrap();
        *slot = addr.as_usize();
    }
    for slot in storage.iter_mut() {
        let root = unsafe { RootCell::new(slot as *mut usize).unwrap() };
        mgr.add_root(root);
        roots.push(root);
    }
    mgr.exit_scope(snap);

    mgr.collect_now();

    let info = mgr.info(1);
    assert_eq!(info.blocks_total, 2, "the heap must not grow to satisfy the third allocation");
    assert_eq!(info.blocks_in_use, 2, "both blocks should be fully occupied");

    let usage = info.per_type.iter().find(|u| u.type_id == page).unwrap();
    assert_eq!(usage.in_heap, 2, "two of the three objects live in the block heap");
    assert_eq!(usage.spill, 1, "the third, heap-exhausted allocation must have spilled");

    for root in roots {
        mgr.remove_root(root);
    }
    mgr.collect_now();
    assert_eq!(mgr.info(0).blocks_in_use, 0);
    assert_eq!(mgr.info(1).per_type.iter().find(|u| u.type_id == page).unwrap().spill, 0);
}
