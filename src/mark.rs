//! The marking engine: precise tracing driven entirely by registered
//! per-type callbacks, with an overflow-tolerant marking stack and the
//! finalization-reachability pass.

use crate::addr::{Addr, MIN_HUNKSIZE};
use crate::anchor::AnchorStack;
use crate::bitmap;
use crate::error::{GcError, GcResult};
use crate::heap::BlockHeap;
use crate::roots::RootTable;
use crate::spill::{read_info_header, ManagedIndex};
use crate::types::{TypeId, TypeRegistry};

/// Where a managed address currently lives.
#[derive(Debug, Clone, Copy)]
pub enum Location {
    /// In the small-object heap, at the given hunk index, owned by the
    /// given type.
    InHeap { hunk: usize, type_id: TypeId },
    /// In the spill index, at the given raw index.
    Spill {
        index: usize,
        type_id: TypeId,
        blob: bool,
    },
}

/// Classify `addr`: is it currently a managed address, and if so where
/// and of what type.
pub fn classify(
    heap: &BlockHeap,
    spill: &mut ManagedIndex,
    types: &TypeRegistry,
    addr: Addr,
) -> Option<Location> {
    if heap.contains(addr) {
        let hunk = heap.hunk_index_of(addr);
        if !heap.bitmap().is_managed(hunk) {
            return None;
        }
        let block_idx = heap.block_index_of(addr);
        let type_id = heap.records()[block_idx].type_id?;
        return Some(Location::InHeap { hunk, type_id });
    }
    let idx = spill.find_managed(addr)?;
    let slot = spill.get(idx);
    if slot.is_obsolete() {
        return None;
    }
    let type_id = if slot.is_blob() {
        crate::types::internal::BLOB
    } else {
        // SAFETY: a non-blob spill slot always has a valid info header
        // written by the allocator at allocation time.
        unsafe { read_info_header(addr) }.type_id_checked(types)
    };
    Some(Location::Spill {
        index: idx,
        type_id,
        blob: slot.is_blob(),
    })
}

impl crate::spill::InfoHeader {
    fn type_id_checked(&self, types: &TypeRegistry) -> TypeId {
        let id = TypeId(self.type_id);
        debug_assert!(types.try_get(id).is_ok(), "corrupt spill info header");
        id
    }
}

/// Size, in bytes, of the object at `loc`. Used to bound a scan over its
/// payload (e.g. for `mark_refs_payload`/`clear_refs`).
pub fn object_size(heap: &BlockHeap, types: &TypeRegistry, addr: Addr, loc: Location) -> usize {
    match loc {
        Location::InHeap { type_id, .. } => {
            let _ = heap;
            types.get(type_id).size
        }
        Location::Spill { blob, .. } => {
            if blob {
                0
            } else {
                unsafe { read_info_header(addr) }.nh as usize * MIN_HUNKSIZE
            }
        }
    }
}

fn is_live(heap: &BlockHeap, spill: &ManagedIndex, loc: Location) -> bool {
    match loc {
        Location::InHeap { hunk, .. } => heap.bitmap().is_live(hunk),
        Location::Spill { index, .. } => spill.get(index).is_live(),
    }
}

fn set_live(heap: &mut BlockHeap, spill: &mut ManagedIndex, loc: Location, on: bool) {
    match loc {
        Location::InHeap { hunk, .. } => {
            if on {
                heap.bitmap_mut().mark_live(hunk);
            } else {
                heap.bitmap_mut().clear_live(hunk);
            }
        }
        Location::Spill { index, .. } => spill.get_mut(index).set_live(on),
    }
}

/// An explicit marking stack with a dynamically tracked capacity. Pushes
/// beyond capacity are rejected and recorded as an overflow rather than
/// growing unboundedly; recovery is handled by
/// [`run_mark_phase`]'s restart-scan loop.
pub struct MarkStack {
    buf: Vec<Addr>,
    capacity: usize,
    overflowed: bool,
}

impl MarkStack {
    /// Build a stack with the given initial capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            overflowed: false,
        }
    }

    fn push(&mut self, addr: Addr) {
        if self.buf.len() >= self.capacity {
            self.overflowed = true;
            return;
        }
        self.buf.push(addr);
    }

    fn pop(&mut self) -> Option<Addr> {
        self.buf.pop()
    }

    /// Read and clear the overflow flag.
    fn take_overflow(&mut self) -> bool {
        std::mem::take(&mut self.overflowed)
    }

    /// Double the stack's capacity. Called once per cycle in which
    /// overflow occurred.
    pub fn double_capacity(&mut self) {
        self.capacity *= 2;
    }

    /// Current capacity, exposed for diagnostics and tests.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// `_mark`: if `addr` is a managed, not-yet-live address, mark it live
/// and push it for later scanning. Addresses that turn out not to be
/// managed are silently ignored here — a type's mark callback is
/// trusted to report real outgoing references; only *roots* are
/// verified (see [`push_root`]).
fn mark_child(
    heap: &mut BlockHeap,
    spill: &mut ManagedIndex,
    types: &TypeRegistry,
    stack: &mut MarkStack,
    addr: Addr,
    debug: bool,
) {
    let Some(loc) = classify(heap, spill, types, addr) else {
        return;
    };
    if is_live(heap, spill, loc) {
        return;
    }
    set_live(heap, spill, loc, true);
    let _ = debug;
    #[cfg(feature = "gc_logging")]
    if debug {
        let type_id = match loc {
            Location::InHeap { type_id, .. } => type_id,
            Location::Spill { type_id, .. } => type_id,
        };
        tracing::trace!(target: "gc::mark", addr = addr.as_usize(), type_id = type_id.0, "marked live");
    }
    stack.push(addr);
}

/// Push a root cell's current contents. Unlike [`mark_child`], an
/// unmanaged non-null root is a fatal programmer error.
fn push_root(
    heap: &mut BlockHeap,
    spill: &mut ManagedIndex,
    types: &TypeRegistry,
    stack: &mut MarkStack,
    raw: usize,
    debug: bool,
) -> GcResult<()> {
    if raw == 0 {
        return Ok(());
    }
    let addr = Addr::new(raw as *mut u8).ok_or(GcError::UnmanagedAddress(raw))?;
    if classify(heap, spill, types, addr).is_none() {
        return Err(GcError::UnmanagedAddress(raw));
    }
    mark_child(heap, spill, types, stack, addr, debug);
    Ok(())
}

fn invoke_mark_fn(
    heap: &mut BlockHeap,
    spill: &mut ManagedIndex,
    types: &TypeRegistry,
    stack: &mut MarkStack,
    addr: Addr,
    loc: Location,
    debug: bool,
) {
    let type_id = match loc {
        Location::InHeap { type_id, .. } => type_id,
        Location::Spill { type_id, .. } => type_id,
    };
    let Some(mark_fn) = types.get(type_id).mark else {
        return;
    };
    let size = object_size(heap, types, addr, loc);
    let _ = debug;
    #[cfg(feature = "gc_logging")]
    if debug {
        tracing::trace!(
            target: "gc::mark",
            addr = addr.as_usize(),
            type_id = type_id.0,
            size,
            "invoking mark callback"
        );
    }
    // The closure captures `heap`/`spill`/`types`/`stack` by unique
    // reference for the duration of this single call; the callback
    // itself never stores the closure past its invocation.
    let mut push = |child: Addr| mark_child(heap, spill, types, stack, child, debug);
    // SAFETY: `addr` is a live managed object of `type_id`, `size` is
    // its declared/recorded size, and `mark_fn` was registered for
    // exactly this type.
    unsafe { mark_fn(addr, size, &mut push) };
}

fn drain(
    heap: &mut BlockHeap,
    spill: &mut ManagedIndex,
    types: &TypeRegistry,
    stack: &mut MarkStack,
    debug: bool,
) {
    while let Some(addr) = stack.pop() {
        if let Some(loc) = classify(heap, spill, types, addr) {
            invoke_mark_fn(heap, spill, types, stack, addr, loc, debug);
        }
    }
}

/// Re-invoke every currently-live object's mark callback. Used by the
/// overflow-recovery loop: since some pushes were dropped, the only
/// sound recovery is to re-derive the live set's outgoing edges from
/// scratch and drain again.
fn rescan_live_objects(
    heap: &mut BlockHeap,
    spill: &mut ManagedIndex,
    types: &TypeRegistry,
    stack: &mut MarkStack,
    debug: bool,
) {
    for block_idx in 0..heap.num_blocks() {
        let Some(type_id) = heap.records()[block_idx].type_id else {
            continue;
        };
        let size = types.get(type_id).size;
        if size == 0 {
            continue;
        }
        let slots: Vec<Addr> = {
            let mut v = Vec::new();
            heap.for_each_slot_in_block(block_idx, size, |a| v.push(a));
            v
        };
        for addr in slots {
            let hunk = heap.hunk_index_of(addr);
            if heap.bitmap().is_managed(hunk) && heap.bitmap().is_live(hunk) {
                invoke_mark_fn(
                    heap,
                    spill,
                    types,
                    stack,
                    addr,
                    Location::InHeap { hunk, type_id },
                    debug,
                );
            }
        }
    }
    let live_spill: Vec<(usize, Addr)> = spill
        .sweep_range()
        .filter_map(|i| {
            let slot = spill.get(i);
            slot.is_live().then(|| (i, slot.addr()))
        })
        .collect();
    for (index, addr) in live_spill {
        let slot = spill.get(index);
        let type_id = if slot.is_blob() {
            crate::types::internal::BLOB
        } else {
            unsafe { read_info_header(addr) }.type_id_checked(types)
        };
        invoke_mark_fn(
            heap,
            spill,
            types,
            stack,
            addr,
            Location::Spill {
                index,
                type_id,
                blob: slot.is_blob(),
            },
            debug,
        );
    }
}

fn collect_finalization_candidates(
    heap: &BlockHeap,
    spill: &ManagedIndex,
    types: &TypeRegistry,
) -> Vec<Addr> {
    let mut out = Vec::new();
    for block_idx in 0..heap.num_blocks() {
        let Some(type_id) = heap.records()[block_idx].type_id else {
            continue;
        };
        if types.get(type_id).finalize.is_none() {
            continue;
        }
        let size = types.get(type_id).size;
        if size == 0 {
            continue;
        }
        heap.for_each_slot_in_block(block_idx, size, |addr| {
            let hunk = heap.hunk_index_of(addr);
            if heap.bitmap().is_managed(hunk) && !heap.bitmap().is_live(hunk) {
                out.push(addr);
            }
        });
    }
    for i in spill.sweep_range() {
        let slot = spill.get(i);
        if slot.is_blob() || slot.is_live() {
            continue;
        }
        let info = unsafe { read_info_header(slot.addr()) };
        let type_id = TypeId(info.type_id);
        if types.try_get(type_id).ok().and_then(|r| r.finalize).is_some() {
            out.push(slot.addr());
        }
    }
    out
}

/// Final step of the marking algorithm: give finalization-capable, currently
/// unreachable objects a chance to have their outgoing references
/// marked (so finalizers see an intact field graph), then clear the
/// root object's own live bit so it is still reclaimed this cycle.
fn finalization_reachability_pass(
    heap: &mut BlockHeap,
    spill: &mut ManagedIndex,
    types: &TypeRegistry,
    stack: &mut MarkStack,
    debug: bool,
) {
    let candidates = collect_finalization_candidates(heap, spill, types);
    if candidates.is_empty() {
        return;
    }
    for &addr in &candidates {
        if let Some(loc) = classify(heap, spill, types, addr) {
            set_live(heap, spill, loc, true);
            invoke_mark_fn(heap, spill, types, stack, addr, loc, debug);
        }
    }
    drain(heap, spill, types, stack, debug);
    for &addr in &candidates {
        if let Some(loc) = classify(heap, spill, types, addr) {
            set_live(heap, spill, loc, false);
        }
    }
}

/// Run one full marking cycle: pin the managed index, push roots (the
/// client's root cells plus every currently-anchored address), drain
/// with overflow recovery, then run the finalization-reachability pass.
/// Returns whether the marking stack overflowed at any point during this
/// cycle (the caller doubles its capacity for next time if so).
///
/// `debug` gates `tracing::trace!`-level chatter for each object marked
/// and each mark callback invoked (feature `gc_logging` must also be on);
/// it additionally upgrades the no-live-bits invariant below from a
/// `debug_assert!` to an `assert!`, so callers can catch a corrupted
/// bitmap in a release build while tracking down a bug.
pub fn run_mark_phase(
    heap: &mut BlockHeap,
    spill: &mut ManagedIndex,
    types: &TypeRegistry,
    roots: &RootTable,
    anchors: &AnchorStack,
    stack: &mut MarkStack,
    debug: bool,
) -> GcResult<bool> {
    if debug {
        assert!(heap.bitmap().no_live_bits_set());
    } else {
        debug_assert!(heap.bitmap().no_live_bits_set());
    }
    spill.begin_collection();

    for cell in roots.iter() {
        push_root(heap, spill, types, stack, cell.get(), debug)?;
    }
    // Anchored addresses always originate from the allocator, so unlike
    // client root cells they are trusted without the hard-error check
    // `push_root` applies.
    for addr in anchors.iter() {
        mark_child(heap, spill, types, stack, addr, debug);
    }

    let mut overflow_occurred = false;
    loop {
        drain(heap, spill, types, stack, debug);
        if stack.take_overflow() {
            overflow_occurred = true;
            rescan_live_objects(heap, spill, types, stack, debug);
        } else {
            break;
        }
    }

    finalization_reachability_pass(heap, spill, types, stack, debug);

    Ok(overflow_occurred)
}

/// Generic `clear` callback: zero `size` bytes at `addr`. Used by the
/// internal `refs` type (and available to client types whose payload is
/// just bytes that should start zeroed).
///
/// # Safety
/// `addr` must be valid for writes of `size` bytes.
pub unsafe fn clear_refs(addr: Addr, size: usize) {
    unsafe { std::ptr::write_bytes(addr.as_ptr(), 0, size) };
}

/// Generic `mark` callback: treat the `size`-byte payload at `addr` as a
/// contiguous array of potential references (pointer-sized slots) and
/// push every non-null one. Used by the internal `refs` type.
///
/// # Safety
/// `addr` must be valid for reads of `size` bytes, and every non-zero
/// `usize`-sized slot in that range is expected to be an address
/// previously returned by the allocator.
pub unsafe fn mark_refs_payload(addr: Addr, size: usize, push: &mut dyn FnMut(Addr)) {
    let n = size / std::mem::size_of::<usize>();
    let base = addr.as_ptr() as *const usize;
    for i in 0..n {
        let v = unsafe { base.add(i).read() };
        if v != 0 {
            if let Some(child) = Addr::new(v as *mut u8) {
                push(child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_stack_overflow_is_recorded_and_recoverable() {
        let mut stack = MarkStack::new(2);
        stack.push(unsafe { Addr::new_unchecked(8 as *mut u8) });
        stack.push(unsafe { Addr::new_unchecked(16 as *mut u8) });
        stack.push(unsafe { Addr::new_unchecked(24 as *mut u8) });
        assert!(stack.take_overflow());
        assert!(!stack.take_overflow());
        stack.double_capacity();
        assert_eq!(stack.capacity(), 4);
    }
}
