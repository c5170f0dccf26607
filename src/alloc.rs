//! The allocation family: `alloc`, `malloc`/`allocv`, `blob`, `strdup`,
//! and the collection-trigger bookkeeping that watches how much has been
//! handed out since the last cycle.
//!
//! The trigger thresholds are checked *before* allocating rather than
//! after. A collection can then never run between "object exists" and
//! "caller has a chance to root it", so no transient-anchoring step is
//! needed to protect a freshly allocated, not-yet-rooted object from its
//! own allocation call. See the trigger-ordering entry in `DESIGN.md`.

use std::alloc::Layout;

use crate::addr::{fix_size, Addr, MIN_HUNKSIZE};
use crate::config::{BLOCKSIZE, MAX_BLOCKS, MAX_HEAP_BYTES, MAX_VOLUME};
use crate::error::{GcError, GcResult};
use crate::heap::BlockHeap;
use crate::spill::{seal, write_info_header, ManagedIndex, SpillSlot};
use crate::sweep::ManagedLayouts;
use crate::types::{TypeId, TypeRegistry};

/// Collection-trigger bookkeeping: how much has been allocated since the
/// last cycle, and the no-gc suppression state. Owned by the manager,
/// threaded explicitly into every allocation call.
pub struct TriggerState {
    num_alloc_blocks: usize,
    vol_allocs: usize,
    block_threshold: usize,
    volume_threshold: usize,
    gc_disabled: bool,
    collect_requested: bool,
    idle_calls: u32,
}

impl TriggerState {
    /// Build trigger state for a heap of `num_blocks` blocks totalling
    /// `heap_bytes` bytes, deriving thresholds as
    /// `min(MAX_BLOCKS, num_blocks/3)` / `min(MAX_VOLUME, heap_bytes/2)`.
    pub fn new(num_blocks: usize, heap_bytes: usize) -> Self {
        Self {
            num_alloc_blocks: 0,
            vol_allocs: 0,
            block_threshold: MAX_BLOCKS.min(num_blocks / 3),
            volume_threshold: MAX_VOLUME.min(heap_bytes / 2),
            gc_disabled: false,
            collect_requested: false,
            idle_calls: 0,
        }
    }

    /// Record that a collection is about to run (or was just requested),
    /// for the caller to decide whether to actually run one.
    pub fn should_collect(&self) -> bool {
        !self.gc_disabled
            && (self.num_alloc_blocks >= self.block_threshold
                || self.vol_allocs >= self.volume_threshold
                || self.collect_requested)
    }

    /// Record `bytes` allocated and, if a fresh heap block was claimed,
    /// one more block against the running totals.
    pub fn note_alloc(&mut self, bytes: usize, claimed_block: bool) {
        self.vol_allocs += bytes;
        if claimed_block {
            self.num_alloc_blocks += 1;
        }
    }

    /// Reset the running totals after a collection completes.
    pub fn reset_after_collect(&mut self) {
        self.num_alloc_blocks = 0;
        self.vol_allocs = 0;
        self.collect_requested = false;
    }

    pub fn is_gc_disabled(&self) -> bool {
        self.gc_disabled
    }

    /// Explicit request to collect soon; honoured the next time
    /// `should_collect` is consulted, or immediately on `end_nogc` if the
    /// window has since closed.
    pub fn request_collect(&mut self) {
        self.collect_requested = true;
    }

    /// Suppress collection; returns the previous state to restore later.
    pub fn begin_nogc(&mut self) -> bool {
        let prev = self.gc_disabled;
        self.gc_disabled = true;
        prev
    }

    /// Restore the no-gc state. Returns `true` if a collection was
    /// requested during the window and should now run.
    pub fn end_nogc(&mut self, prev: bool) -> bool {
        self.gc_disabled = prev;
        self.collect_requested && !self.gc_disabled
    }

    /// One `idle()` tick. Returns `true` once `NUM_IDLE_CALLS` quiescent
    /// ticks have accumulated, meaning the caller should force a
    /// collection now and reset the counter.
    pub fn idle_tick(&mut self) -> bool {
        self.idle_calls += 1;
        if self.idle_calls >= crate::config::NUM_IDLE_CALLS {
            self.idle_calls = 0;
            true
        } else {
            false
        }
    }
}

fn claim_or_reuse_block(
    heap: &mut BlockHeap,
    type_id: TypeId,
    size: usize,
    start_b: usize,
) -> Option<(usize, bool)> {
    let num_blocks = heap.num_blocks();
    let orig_b = (start_b + num_blocks - 1) % num_blocks;
    let mut b = start_b;
    loop {
        let rec = heap.records()[b];
        if rec.is_free() {
            heap.records_mut()[b].claim(type_id);
            return Some((b, true));
        }
        if rec.type_id == Some(type_id) && (rec.in_use as usize) < BLOCKSIZE / size {
            return Some((b, false));
        }
        if b == orig_b {
            return None;
        }
        b = (b + 1) % num_blocks;
    }
}

/// Find (claiming a block if necessary) the next free slot for `type_id`,
/// advancing and caching its allocator cursor. Returns `None` if the
/// heap has no room anywhere (caller should collect and retry, or report
/// exhaustion if a retry also fails).
fn find_free_slot(heap: &mut BlockHeap, types: &mut TypeRegistry, type_id: TypeId) -> Option<(Addr, bool)> {
    let size = types.get(type_id).size;
    let cursor = types.get(type_id).cursor;

    if let Some(a) = cursor.current_a {
        let block_idx = a / BLOCKSIZE;
        if heap.records()[block_idx].type_id == Some(type_id) {
            let offset_in_block = a % BLOCKSIZE;
            if let Some(slot) =
                heap.find_free_slot_in_block(block_idx, size, offset_in_block + size)
            {
                types.get_mut(type_id).cursor.current_a = Some(block_idx * BLOCKSIZE + (slot.as_usize() - heap.block_base(block_idx).as_usize()));
                return Some((slot, false));
            }
        }
    }

    let (b, claimed) = claim_or_reuse_block(heap, type_id, size, types.get(type_id).cursor.next_b)?;
    let slot = heap.find_free_slot_in_block(b, size, 0)?;
    let cur = &mut types.get_mut(type_id).cursor;
    cur.current_a = Some(b * BLOCKSIZE + (slot.as_usize() - heap.block_base(b).as_usize()));
    cur.current_amax = b * BLOCKSIZE + crate::heap::amax_offset(size);
    cur.next_b = (b + 1) % heap.num_blocks();
    Some((slot, claimed))
}

/// Allocate a fresh, fixed-size object of `type_id`: a heap-resident slot
/// if the block heap has room, or a spilled, host-allocated entry
/// tagged with the type's info header if a full rotation of the heap
/// finds none. Clears it via the type's clear callback (if any) either
/// way. A spill fallback failing is the only case that reports
/// [`GcError::HostAllocationFailed`]; the caller's next move there is a
/// full collection and one retry.
pub fn alloc_fixed(
    heap: &mut BlockHeap,
    spill: &mut ManagedIndex,
    types: &mut TypeRegistry,
    trigger: &mut TriggerState,
    type_id: TypeId,
) -> GcResult<Addr> {
    let rec = types.try_get(type_id)?;
    if rec.is_variable() {
        return Err(GcError::FixedSizeTypeMismatch(type_id, "type is variable-sized"));
    }
    let size = rec.size;
    let clear = rec.clear;

    if let Some((addr, claimed)) = find_free_slot(heap, types, type_id) {
        let hunk = heap.hunk_index_of(addr);
        heap.bitmap_mut().mark_managed(hunk);
        let block_idx = heap.block_index_of(addr);
        heap.records_mut()[block_idx].in_use += 1;

        if let Some(f) = clear {
            unsafe { f(addr, size) };
        }

        trigger.note_alloc(size, claimed);
        return Ok(addr);
    }

    // A full rotation of the heap found no room for this type: spill
    // instead of reporting exhaustion, exactly as a variable-sized
    // request of the same size would.
    spill_alloc(spill, trigger, type_id, size, clear)
}

fn host_alloc(bytes: usize) -> GcResult<*mut u8> {
    let layout = Layout::from_size_align(bytes, MIN_HUNKSIZE).expect("valid spill layout");
    let p = unsafe { std::alloc::alloc(layout) };
    if p.is_null() {
        return Err(GcError::HostAllocationFailed(bytes));
    }
    Ok(p)
}

/// Allocate a spill-resident object of `type_id` and `size` bytes
/// (already hunk-aligned), running `clear` over the fresh payload and
/// recording it in the managed index. Shared by [`alloc_variable`] and
/// `alloc_fixed`'s heap-exhaustion fallback.
fn spill_alloc(
    spill: &mut ManagedIndex,
    trigger: &mut TriggerState,
    type_id: TypeId,
    size: usize,
    clear: Option<crate::types::ClearFn>,
) -> GcResult<Addr> {
    let header = host_alloc(size + MIN_HUNKSIZE)?;
    let header_addr = Addr::new(header).expect("host allocator returns hunk-aligned memory");
    unsafe { write_info_header(header_addr, type_id, (size / MIN_HUNKSIZE) as u32) };
    let payload = unsafe { seal(header_addr) };

    if let Some(f) = clear {
        unsafe { f(payload, size) };
    }

    spill.add_managed(SpillSlot::new(payload, false));
    trigger.note_alloc(size, false);
    Ok(payload)
}

/// Allocate a variable-sized, spill-resident object of `type_id`
/// (`type_id` must be variable-sized; see `DESIGN.md` for why small
/// variable-sized requests always spill rather than reusing the
/// fixed-size heap).
pub fn alloc_variable(
    spill: &mut ManagedIndex,
    types: &mut TypeRegistry,
    trigger: &mut TriggerState,
    type_id: TypeId,
    size: usize,
) -> GcResult<Addr> {
    let rec = types.try_get(type_id)?;
    if !rec.is_variable() {
        return Err(GcError::FixedSizeTypeMismatch(type_id, "type is fixed-size"));
    }
    let size = fix_size(size);
    if size > MAX_HEAP_BYTES {
        return Err(GcError::AllocationTooLarge(size));
    }
    spill_alloc(spill, trigger, type_id, size, rec.clear)
}

/// Allocate an untyped blob: fixed buckets up to 256 bytes reuse the
/// small-object heap via the pre-registered `blob8..blob256` types,
/// larger requests spill via the variable-sized `blob` type.
pub fn alloc_blob(
    heap: &mut BlockHeap,
    spill: &mut ManagedIndex,
    types: &mut TypeRegistry,
    trigger: &mut TriggerState,
    size: usize,
) -> GcResult<Addr> {
    use crate::types::internal;
    if size <= 256 {
        let bucket = if size <= 8 {
            internal::BLOB8
        } else if size <= 16 {
            internal::BLOB16
        } else if size <= 32 {
            internal::BLOB32
        } else if size <= 64 {
            internal::BLOB64
        } else if size <= 128 {
            internal::BLOB128
        } else {
            internal::BLOB256
        };
        alloc_fixed(heap, spill, types, trigger, bucket)
    } else {
        alloc_variable(spill, types, trigger, internal::BLOB, size)
    }
}

/// Allocate a NUL-terminated copy of `s` as a blob.
pub fn strdup(
    heap: &mut BlockHeap,
    spill: &mut ManagedIndex,
    types: &mut TypeRegistry,
    trigger: &mut TriggerState,
    s: &str,
) -> GcResult<Addr> {
    let bytes = s.as_bytes();
    let addr = alloc_blob(heap, spill, types, trigger, bytes.len() + 1)?;
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr.as_ptr(), bytes.len());
        addr.as_ptr().add(bytes.len()).write(0);
    }
    Ok(addr)
}

/// Import a host-allocated, `layout`-described region as an opaque,
/// untraced managed blob. The manager takes ownership: it will call
/// `dealloc(addr, layout)` once the import becomes unreachable, and the
/// caller must not free it itself. See the `manage()` contract decision
/// in `DESIGN.md`.
pub fn import_foreign(
    spill: &mut ManagedIndex,
    blob_layouts: &mut ManagedLayouts,
    addr: Addr,
    layout: Layout,
) -> GcResult<()> {
    if layout.align() > MIN_HUNKSIZE || addr.as_usize() % MIN_HUNKSIZE != 0 {
        return Err(GcError::UnmanagedAddress(addr.as_usize()));
    }
    blob_layouts.insert(addr.as_usize(), layout);
    spill.add_managed(SpillSlot::new(addr, true));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_TYPES;

    #[test]
    fn alloc_fixed_clears_and_marks_managed() {
        let mut heap = BlockHeap::new(2);
        let mut spill = ManagedIndex::new(16);
        let mut types = TypeRegistry::new(MIN_TYPES);
        let mut trigger = TriggerState::new(2, 2 * BLOCKSIZE);
        let id = types.register_type("widget", 32, None, None, None).unwrap();

        let addr = alloc_fixed(&mut heap, &mut spill, &mut types, &mut trigger, id).unwrap();
        let hunk = heap.hunk_index_of(addr);
        assert!(heap.bitmap().is_managed(hunk));
    }

    #[test]
    fn alloc_fixed_rejects_variable_type() {
        let mut heap = BlockHeap::new(2);
        let mut spill = ManagedIndex::new(16);
        let mut types = TypeRegistry::new(MIN_TYPES);
        let mut trigger = TriggerState::new(2, 2 * BLOCKSIZE);
        let err = alloc_fixed(
            &mut heap,
            &mut spill,
            &mut types,
            &mut trigger,
            crate::types::internal::BLOB,
        );
        assert!(matches!(err, Err(GcError::FixedSizeTypeMismatch(_, _))));
    }

    #[test]
    fn alloc_fixed_spills_once_the_heap_is_exhausted() {
        let mut heap = BlockHeap::new(1);
        let mut spill = ManagedIndex::new(16);
        let mut types = TypeRegistry::new(MIN_TYPES);
        let mut trigger = TriggerState::new(1, BLOCKSIZE);
        // BLOCKSIZE-sized slots: exactly one fits per block, so the
        // second allocation finds the heap full on its first rotation.
        let id = types.register_type("page", BLOCKSIZE, None, None, None).unwrap();

        let first = alloc_fixed(&mut heap, &mut spill, &mut types, &mut trigger, id).unwrap();
        assert!(heap.contains(first));

        let second = alloc_fixed(&mut heap, &mut spill, &mut types, &mut trigger, id).unwrap();
        assert!(!heap.contains(second));
        let info = unsafe { crate::spill::read_info_header(second) };
        assert_eq!(info.type_id, id.0);
        unsafe {
            std::alloc::dealloc(
                crate::spill::unseal(second).as_ptr(),
                Layout::from_size_align(
                    info.nh as usize * MIN_HUNKSIZE + MIN_HUNKSIZE,
                    MIN_HUNKSIZE,
                )
                .unwrap(),
            )
        };
    }

    #[test]
    fn alloc_variable_writes_retrievable_info_header() {
        let mut spill = ManagedIndex::new(16);
        let mut types = TypeRegistry::new(MIN_TYPES);
        let mut trigger = TriggerState::new(2, 2 * BLOCKSIZE);
        let addr = alloc_variable(
            &mut spill,
            &mut types,
            &mut trigger,
            crate::types::internal::BLOB,
            100,
        )
        .unwrap();
        let info = unsafe { crate::spill::read_info_header(addr) };
        assert_eq!(info.type_id, crate::types::internal::BLOB.0);
        unsafe { std::alloc::dealloc(crate::spill::unseal(addr).as_ptr(), Layout::from_size_align(info.nh as usize * MIN_HUNKSIZE + MIN_HUNKSIZE, MIN_HUNKSIZE).unwrap()) };
    }

    #[test]
    fn trigger_fires_after_volume_threshold() {
        let mut trigger = TriggerState::new(21, 21 * BLOCKSIZE);
        assert!(!trigger.should_collect());
        trigger.note_alloc(trigger.volume_threshold, false);
        assert!(trigger.should_collect());
        trigger.reset_after_collect();
        assert!(!trigger.should_collect());
    }

    #[test]
    fn nogc_window_defers_requested_collection() {
        let mut trigger = TriggerState::new(21, 21 * BLOCKSIZE);
        let prev = trigger.begin_nogc();
        trigger.request_collect();
        assert!(!trigger.should_collect()); // suppressed while disabled
        let should_run = trigger.end_nogc(prev);
        assert!(should_run);
    }
}
