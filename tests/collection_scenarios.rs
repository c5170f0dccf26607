//! End-to-end collection scenarios: reachability through client-held
//! roots and through field graphs a type's own mark callback reports,
//! plus recovery from a marking stack forced to overflow.

use precise_gc::mark::{clear_refs, mark_refs_payload};
use precise_gc::{Addr, GcConfig, Manager, RootCell};

const PTR: usize = std::mem::size_of::<usize>();

fn cfg(num_blocks: usize) -> GcConfig {
    GcConfig::default().with_num_blocks(num_blocks)
}

unsafe fn set_field(addr: Addr, slot: usize, target: Addr) {
    unsafe { (addr.as_ptr() as *mut usize).add(slot).write(target.as_usize()) };
}

#[test]
fn unreachable_tree_is_fully_reclaimed() {
    let mut mgr = Manager::init(cfg(64), None).unwrap();
    let tree = mgr
        .register_type("tree", 3 * PTR, Some(clear_refs), Some(mark_refs_payload), None)
        .unwrap();

    let snap = mgr.enter_scope();
    for _ in 0..100 {
        mgr.alloc(tree).unwrap();
    }
    mgr.exit_scope(snap);

    let reclaimed = mgr.collect_now();
    assert_eq!(reclaimed, 100);

    let info = mgr.info(1);
    let usage = info.per_type.iter().find(|u| u.type_id == tree).unwrap();
    assert_eq!(usage.in_heap, 0);
    assert_eq!(usage.spill, 0);
}

#[test]
fn rooted_chain_keeps_referenced_node_alive() {
    let mut mgr = Manager::init(cfg(64), None).unwrap();
    let tree = mgr
        .register_type("tree", 3 * PTR, Some(clear_refs), Some(mark_refs_payload), None)
        .unwrap();

    let snap = mgr.enter_scope();
    let a = mgr.alloc(tree).unwrap();
    mgr.exit_scope(snap);
    let mut a_cell_storage: usize = a.as_usize();
    let a_root = unsafe { RootCell::new(&mut a_cell_storage as *mut usize).unwrap() };
    mgr.add_root(a_root);

    let snap = mgr.enter_scope();
    let b = mgr.alloc(tree).unwrap();
    unsafe { set_field(a, 0, b) };
    mgr.exit_scope(snap);

    mgr.collect_now();
    assert!(mgr.is_managed(a));
    assert!(mgr.is_managed(b));

    mgr.remove_root(a_root);
    mgr.collect_now();
    assert!(!mgr.is_managed(a));
    assert!(!mgr.is_managed(b));
}

#[test]
fn marking_stack_overflow_recovers_without_losing_reachable_objects() {
    const FANOUT: usize = 10_000;

    let mut mgr = Manager::init(cfg(200).with_min_stack(64), None).unwrap();
    let leaf = mgr.register_type("leaf", PTR, None, None, None).unwrap();
    let hub = mgr
        .register_type("hub", 0, Some(clear_refs), Some(mark_refs_payload), None)
        .unwrap();

    let snap = mgr.enter_scope();
    let mut leaves = Vec::with_capacity(FANOUT);
    for _ in 0..FANOUT {
        leaves.push(mgr.alloc(leaf).unwrap());
    }

    let hub_addr = mgr.alloc_variable(hub, FANOUT * PTR).unwrap();
    for (i, leaf_addr) in leaves.iter().enumerate() {
        unsafe { set_field(hub_addr, i, *leaf_addr) };
    }

    let mut hub_cell_storage: usize = hub_addr.as_usize();
    let hub_root = unsafe { RootCell::new(&mut hub_cell_storage as *mut usize).unwrap() };
    mgr.add_root(hub_root);
    mgr.exit_scope(snap);

    mgr.collect_now();

    assert!(mgr.is_managed(hub_addr));
    for leaf_addr in &leaves {
        assert!(mgr.is_managed(*leaf_addr));
    }

    mgr.remove_root(hub_root);
    mgr.collect_now();
    assert!(!mgr.is_managed(hub_addr));
    for leaf_addr in &leaves {
        assert!(!mgr.is_managed(*leaf_addr));
    }
}
