//! The sweeper: post-mark reclamation of both the block heap and the
//! spill area, with finalizer resurrection and notify firing.

use std::alloc::Layout;

use rustc_hash::FxHashMap;

use crate::addr::{Addr, MIN_HUNKSIZE};
use crate::heap::BlockHeap;
use crate::spill::{read_info_header, unseal, ManagedIndex};
use crate::types::{TypeId, TypeRegistry};

/// Client-wide callback fired once per reclaimed object whose notify bit
/// was set.
pub type NotifyFn = fn(Addr);

/// Outcome of one sweep pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepStats {
    /// Objects actually reclaimed (excludes resurrected objects).
    pub reclaimed: usize,
}

/// Layout of a host allocation the manager does not otherwise track the
/// size of — i.e. one imported via `manage()`. Spill allocations made by
/// the manager's own allocator reconstruct their layout from the info
/// header's hunk count instead.
pub type ManagedLayouts = FxHashMap<usize, Layout>;

fn spill_layout(nh: u32) -> Layout {
    let bytes = (nh as usize + 1) * MIN_HUNKSIZE;
    Layout::from_size_align(bytes, MIN_HUNKSIZE).expect("valid spill layout")
}

/// Sweep both heaps: unmark survivors, reclaim the rest (running
/// finalizers and firing notify first), then let the spill index pin
/// down and compact. Returns the number of objects actually freed.
pub fn sweep_now(
    heap: &mut BlockHeap,
    spill: &mut ManagedIndex,
    types: &mut TypeRegistry,
    notify: Option<NotifyFn>,
    blob_layouts: &mut ManagedLayouts,
) -> SweepStats {
    let mut n = 0;
    n += sweep_heap(heap, types, notify);
    n += sweep_spill(spill, types, notify, blob_layouts);
    spill.end_collection();
    spill.compact_managed();
    SweepStats { reclaimed: n }
}

fn sweep_heap(heap: &mut BlockHeap, types: &mut TypeRegistry, notify: Option<NotifyFn>) -> usize {
    let mut n = 0;
    for b in 0..heap.num_blocks() {
        let in_use = heap.records()[b].in_use;
        let Some(type_id) = heap.records()[b].type_id else {
            continue;
        };
        if in_use == 0 {
            continue;
        }
        let size = types.get(type_id).size;
        debug_assert!(size > 0, "an occupied block always belongs to a fixed-size type");

        let slots: Vec<Addr> = {
            let mut v = Vec::new();
            heap.for_each_slot_in_block(b, size, |a| v.push(a));
            v
        };
        for addr in slots {
            let hunk = heap.hunk_index_of(addr);
            if !heap.bitmap().is_managed(hunk) {
                continue;
            }
            if heap.bitmap().is_live(hunk) {
                heap.bitmap_mut().clear_live(hunk);
                continue;
            }

            if let Some(f) = types.get(type_id).finalize {
                // SAFETY: addr is a currently-managed object of type_id,
                // about to be reclaimed unless the finalizer resurrects it.
                if !unsafe { f(addr, size) } {
                    continue;
                }
            }

            if heap.bitmap().is_notify(hunk) {
                heap.bitmap_mut().clear_notify(hunk);
                if let Some(cb) = notify {
                    cb(addr);
                }
            }
            heap.bitmap_mut().unmark_managed(hunk);

            let rec = &mut heap.records_mut()[b];
            debug_assert!(rec.in_use > 0);
            rec.in_use -= 1;
            if rec.in_use == 0 {
                rec.release();
            }

            let cursor = &mut types.get_mut(type_id).cursor;
            if b < cursor.next_b {
                cursor.next_b = b;
            }
            n += 1;
        }
    }
    n
}

fn sweep_spill(
    spill: &mut ManagedIndex,
    types: &TypeRegistry,
    notify: Option<NotifyFn>,
    blob_layouts: &mut ManagedLayouts,
) -> usize {
    let mut n = 0;
    let range: Vec<usize> = spill.sweep_range().collect();
    for i in range {
        let slot = spill.get(i);
        if slot.is_live() {
            spill.get_mut(i).set_live(false);
            continue;
        }

        let addr = slot.addr();
        let mut info_nh: Option<u32> = None;
        if slot.is_blob() {
            // Imported via `manage()`: no info header, never finalized or
            // traced — the client handed over an opaque, already-owned
            // allocation.
        } else {
            // SAFETY: every non-blob spill slot carries a header written
            // by the allocator.
            let info = unsafe { read_info_header(addr) };
            info_nh = Some(info.nh);
            let type_id = TypeId(info.type_id);
            if let Ok(rec) = types.try_get(type_id) {
                if let Some(f) = rec.finalize {
                    let size = info.nh as usize * MIN_HUNKSIZE;
                    // SAFETY: addr is a currently-managed object about to
                    // be reclaimed unless resurrected.
                    if !unsafe { f(addr, size) } {
                        continue;
                    }
                }
            }
        }

        if slot.is_notify() {
            spill.get_mut(i).set_notify(false);
            if let Some(cb) = notify {
                cb(addr);
            }
        }

        spill.get_mut(i).mark_obsolete();
        free_spill_object(addr, slot.is_blob(), info_nh, blob_layouts);
        n += 1;
    }
    n
}

/// Free one spill object's backing allocation, given whether it is a
/// `manage()`-imported blob (freed via its recorded [`Layout`]) or an
/// ordinary spill allocation (freed via its reconstructed info-header
/// layout). Exposed `pub(crate)` so [`crate::manager::Manager`]'s `Drop`
/// impl can reuse it to release everything still outstanding at teardown.
pub(crate) fn free_spill_object(
    addr: Addr,
    is_blob: bool,
    info_nh: Option<u32>,
    blob_layouts: &mut ManagedLayouts,
) {
    if is_blob {
        let key = addr.as_usize();
        let layout = blob_layouts
            .remove(&key)
            .expect("manage()'d address missing its recorded layout");
        unsafe { std::alloc::dealloc(addr.as_ptr(), layout) };
    } else {
        let nh = info_nh.expect("non-blob spill entry always carries an info header");
        let header = unsafe { unseal(addr) };
        let layout = spill_layout(nh);
        unsafe { std::alloc::dealloc(header.as_ptr(), layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_TYPES;
    use crate::spill::{write_info_header, SpillSlot};
    use std::cell::Cell;

    #[test]
    fn live_spill_entries_survive_and_clear_live_bit() {
        let mut types = TypeRegistry::new(MIN_TYPES);
        let mut spill = ManagedIndex::new(16);
        let mut blob_layouts = ManagedLayouts::default();

        let layout = Layout::from_size_align(16, MIN_HUNKSIZE).unwrap();
        let header = unsafe { std::alloc::alloc_zeroed(layout) };
        let header_addr = Addr::new(header).unwrap();
        unsafe { write_info_header(header_addr, crate::types::internal::BLOB, 1) };
        let payload = unsafe { crate::spill::seal(header_addr) };

        let mut slot = SpillSlot::new(payload, false);
        slot.set_live(true);
        spill.add_managed(slot);
        spill.begin_collection();

        let stats = sweep_now(
            &mut crate::heap::BlockHeap::new(1),
            &mut spill,
            &mut types,
            None,
            &mut blob_layouts,
        );
        assert_eq!(stats.reclaimed, 0);
        assert!(!spill.get(0).is_live());
    }

    #[test]
    fn dead_blob_import_is_freed_via_recorded_layout() {
        let mut types = TypeRegistry::new(MIN_TYPES);
        let mut spill = ManagedIndex::new(16);
        let mut blob_layouts = ManagedLayouts::default();

        let layout = Layout::from_size_align(8, MIN_HUNKSIZE).unwrap();
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let addr = Addr::new(raw).unwrap();
        blob_layouts.insert(addr.as_usize(), layout);
        spill.add_managed(SpillSlot::new(addr, true));
        spill.begin_collection();

        let notified = Cell::new(false);
        let _ = &notified;

        let stats = sweep_now(
            &mut crate::heap::BlockHeap::new(1),
            &mut spill,
            &mut types,
            None,
            &mut blob_layouts,
        );
        assert_eq!(stats.reclaimed, 1);
        assert!(blob_layouts.is_empty());
    }
}
