//! `Manager`: the top-level context wiring the block heap, spill index,
//! type registry, root table, anchor stack and marking/sweeping engines
//! together behind the public API.
//!
//! All of that state lives behind one owned value rather than as
//! process-wide globals, so a process may hold more than one `Manager`;
//! nothing but the type system enforces that a given `Manager` is only
//! ever touched from one thread at a time (it deliberately does not
//! implement `Sync`; see `DESIGN.md`).

use std::alloc::Layout;

use crate::addr::Addr;
use crate::alloc::{self, TriggerState};
use crate::anchor::{AnchorStack, ScopeMark};
use crate::config::{GcConfig, BLOCKSIZE, MAX_HEAP_BYTES, MIN_NUMBLOCKS};
use crate::error::{GcError, GcResult};
use crate::heap::BlockHeap;
use crate::mark::{self, Location, MarkStack};
use crate::roots::{RootCell, RootTable};
use crate::spill::{read_info_header, ManagedIndex};
use crate::sweep::{self, ManagedLayouts, NotifyFn};
use crate::types::{ClearFn, FinalizeFn, MarkFn, TypeId, TypeRegistry};

/// Per-type allocation counts reported by [`Manager::info`].
#[derive(Debug, Clone, Copy)]
pub struct TypeUsage {
    pub type_id: TypeId,
    pub name: &'static str,
    /// Live objects of this type currently occupying the small-object heap.
    pub in_heap: usize,
    /// Live objects of this type currently in the spill area. Only
    /// populated when `info` is called with `level >= 1`, since it costs
    /// an O(n) scan of the spill index.
    pub spill: usize,
}

/// A diagnostic snapshot of the manager's current occupancy, returned by
/// [`Manager::info`]. Structured rather than a level-gated textual dump,
/// per the `info(level)` decision in `DESIGN.md`.
#[derive(Debug, Clone)]
pub struct RegistryInfo {
    pub blocks_total: usize,
    pub blocks_in_use: usize,
    pub per_type: Vec<TypeUsage>,
    /// Number of `manage()`-imported addresses still outstanding. Only
    /// populated at `level >= 1`.
    pub foreign_imports: usize,
}

/// The memory manager context. Owns the small-object heap, spill index,
/// type registry, root table, anchor stack, marking stack and collection
/// trigger state.
pub struct Manager {
    heap: BlockHeap,
    spill: ManagedIndex,
    types: TypeRegistry,
    roots: RootTable,
    anchors: AnchorStack,
    mark_stack: MarkStack,
    trigger: TriggerState,
    blob_layouts: ManagedLayouts,
    notify_cb: Option<NotifyFn>,
    debug: bool,
    in_progress: bool,
}

// SAFETY: every field is only ever reached through `&mut Manager`
// (or `&Manager` for read-only accessors); `Manager` intentionally does
// not implement `Sync`, so there is never concurrent access to guard
// against within a single instance.
unsafe impl Send for Manager {}

impl Manager {
    /// Build a fresh manager from `config`. Always succeeds: there is no
    /// implicit global state for a second `init` call to collide with, so
    /// [`GcError::AlreadyInitialized`] is reserved for a client layering
    /// its own singleton wrapper (e.g. a `OnceLock<Manager>`) to surface
    /// from there, rather than exercised by this constructor. See the
    /// non-singleton embedding note in `DESIGN.md`.
    pub fn init(config: GcConfig, notify_cb: Option<NotifyFn>) -> GcResult<Self> {
        let num_blocks = config
            .num_blocks
            .max(MIN_NUMBLOCKS)
            .min(MAX_HEAP_BYTES / BLOCKSIZE);
        let heap_bytes = num_blocks * BLOCKSIZE;

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "gc::manager",
            num_blocks,
            heap_bytes,
            "initializing manager"
        );

        Ok(Self {
            heap: BlockHeap::new(num_blocks),
            spill: ManagedIndex::new(config.min_managed),
            types: TypeRegistry::new(config.min_types),
            roots: RootTable::new(config.min_roots),
            anchors: AnchorStack::new(),
            mark_stack: MarkStack::new(config.min_stack),
            trigger: TriggerState::new(num_blocks, heap_bytes),
            blob_layouts: ManagedLayouts::default(),
            notify_cb,
            debug: config.debug,
            in_progress: false,
        })
    }

    /// Toggle verbose per-allocation/per-mark `tracing::trace!` chatter
    /// (only emitted when the `gc_logging` feature is also on) and a
    /// handful of invariant checks that are otherwise `debug_assert!`s,
    /// upgraded to `assert!` while this is on so they catch corruption in
    /// a release build too.
    pub fn set_debug(&mut self, on: bool) {
        self.debug = on;
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// Trace one allocation's address and type (per-allocation chatter
    /// promised by [`Self::set_debug`]), and assert the allocator handed
    /// back an address that actually classifies as managed.
    fn debug_trace_alloc(&mut self, addr: Addr) {
        if !self.debug {
            return;
        }
        let loc = mark::classify(&self.heap, &mut self.spill, &self.types, addr);
        #[cfg(feature = "gc_logging")]
        if let Some(loc) = loc {
            let type_id = match loc {
                Location::InHeap { type_id, .. } => type_id,
                Location::Spill { type_id, .. } => type_id,
            };
            tracing::trace!(
                target: "gc::manager",
                type_id = type_id.0,
                addr = addr.as_usize(),
                "allocated"
            );
        }
        assert!(
            loc.is_some(),
            "allocator returned an address that does not classify as managed: {addr:?}"
        );
    }

    /// Register a new type, or return the existing id if `name` was
    /// already registered with an identical signature.
    pub fn register_type(
        &mut self,
        name: &'static str,
        size: usize,
        clear: Option<ClearFn>,
        mark: Option<MarkFn>,
        finalize: Option<FinalizeFn>,
    ) -> GcResult<TypeId> {
        self.types.register_type(name, size, clear, mark, finalize)
    }

    /// Register `cell` as a root. Duplicate registration is a no-op.
    pub fn add_root(&mut self, cell: RootCell) -> bool {
        self.roots.add_root(cell)
    }

    /// Unregister `cell`.
    pub fn remove_root(&mut self, cell: RootCell) -> bool {
        self.roots.remove_root(cell)
    }

    fn maybe_collect(&mut self) {
        if self.trigger.should_collect() {
            self.run_collection();
        }
    }

    /// Allocate a fresh, fixed-size object of `type_id`. The fresh address
    /// is pushed onto the anchor stack before it is handed back, so it
    /// survives any collection a *later* allocation call might trigger
    /// before the caller gets a chance to root or install it (see the
    /// `enter_scope`/`anchor`/`exit_scope` pattern in `anchor.rs`).
    pub fn alloc(&mut self, type_id: TypeId) -> GcResult<Addr> {
        self.maybe_collect();
        let addr = match alloc::alloc_fixed(&mut self.heap, &mut self.spill, &mut self.types, &mut self.trigger, type_id) {
            Err(GcError::HostAllocationFailed(_)) => {
                self.run_collection();
                alloc::alloc_fixed(&mut self.heap, &mut self.spill, &mut self.types, &mut self.trigger, type_id)?
            }
            other => other?,
        };
        self.anchors.anchor(addr);
        self.debug_trace_alloc(addr);
        Ok(addr)
    }

    /// Allocate a fresh, variable-sized object of `type_id`, `size` bytes.
    /// Anchored on return; see [`Self::alloc`].
    pub fn alloc_variable(&mut self, type_id: TypeId, size: usize) -> GcResult<Addr> {
        self.maybe_collect();
        let addr = match alloc::alloc_variable(&mut self.spill, &mut self.types, &mut self.trigger, type_id, size) {
            Err(GcError::HostAllocationFailed(_)) => {
                self.run_collection();
                alloc::alloc_variable(&mut self.spill, &mut self.types, &mut self.trigger, type_id, size)?
            }
            other => other?,
        };
        self.anchors.anchor(addr);
        self.debug_trace_alloc(addr);
        Ok(addr)
    }

    /// Allocate `n` bytes of `type_id`, routing to the fixed or
    /// variable-sized path depending on how the type was registered. The
    /// placement decision is pinned to registration time rather than
    /// chosen from `n` at call time (see `DESIGN.md`), so a fixed-size
    /// type here requires `n` to match its declared size exactly.
    pub fn malloc(&mut self, type_id: TypeId, n: usize) -> GcResult<Addr> {
        let rec = self.types.try_get(type_id)?;
        if rec.is_variable() {
            self.alloc_variable(type_id, n)
        } else if n == rec.size {
            self.alloc(type_id)
        } else {
            Err(GcError::FixedSizeTypeMismatch(
                type_id,
                "requested size does not match the type's declared size",
            ))
        }
    }

    /// Allocate an untyped blob of `size` bytes (small requests reuse the
    /// pre-registered fixed buckets, larger ones spill). Anchored on
    /// return; see [`Self::alloc`].
    pub fn blob(&mut self, size: usize) -> GcResult<Addr> {
        self.maybe_collect();
        let addr = match alloc::alloc_blob(&mut self.heap, &mut self.spill, &mut self.types, &mut self.trigger, size) {
            Err(GcError::HostAllocationFailed(_)) => {
                self.run_collection();
                alloc::alloc_blob(&mut self.heap, &mut self.spill, &mut self.types, &mut self.trigger, size)?
            }
            other => other?,
        };
        self.anchors.anchor(addr);
        self.debug_trace_alloc(addr);
        Ok(addr)
    }

    /// Allocate a NUL-terminated managed copy of `s`. Anchored on return;
    /// see [`Self::alloc`].
    pub fn strdup(&mut self, s: &str) -> GcResult<Addr> {
        self.maybe_collect();
        let addr = match alloc::strdup(&mut self.heap, &mut self.spill, &mut self.types, &mut self.trigger, s) {
            Err(GcError::HostAllocationFailed(_)) => {
                self.run_collection();
                alloc::strdup(&mut self.heap, &mut self.spill, &mut self.types, &mut self.trigger, s)?
            }
            other => other?,
        };
        self.anchors.anchor(addr);
        self.debug_trace_alloc(addr);
        Ok(addr)
    }

    /// Import a host-allocated, `layout`-described region as an opaque,
    /// untraced managed blob. The manager takes ownership and will
    /// `dealloc` it with `layout` once unreachable; the caller must not
    /// free it itself. The import is anchored in the current scope
    /// immediately, so it survives until the caller installs it or exits
    /// scope.
    pub fn manage(&mut self, addr: Addr, layout: Layout) -> GcResult<()> {
        alloc::import_foreign(&mut self.spill, &mut self.blob_layouts, addr, layout)?;
        self.anchors.anchor(addr);
        self.debug_trace_alloc(addr);
        Ok(())
    }

    /// True iff `addr` is a currently-managed, non-obsolete address.
    pub fn is_managed(&mut self, addr: Addr) -> bool {
        mark::classify(&self.heap, &mut self.spill, &self.types, addr).is_some()
    }

    /// Set or clear `addr`'s per-object notify bit.
    pub fn notify(&mut self, addr: Addr, on: bool) -> GcResult<()> {
        let loc = mark::classify(&self.heap, &mut self.spill, &self.types, addr)
            .ok_or(GcError::UnmanagedAddress(addr.as_usize()))?;
        match loc {
            Location::InHeap { hunk, .. } => {
                if on {
                    self.heap.bitmap_mut().mark_notify(hunk);
                } else {
                    self.heap.bitmap_mut().clear_notify(hunk);
                }
            }
            Location::Spill { index, .. } => self.spill.get_mut(index).set_notify(on),
        }
        Ok(())
    }

    /// The registered type of a currently-managed address.
    pub fn type_of(&mut self, addr: Addr) -> GcResult<TypeId> {
        match mark::classify(&self.heap, &mut self.spill, &self.types, addr)
            .ok_or(GcError::UnmanagedAddress(addr.as_usize()))?
        {
            Location::InHeap { type_id, .. } => Ok(type_id),
            Location::Spill { type_id, .. } => Ok(type_id),
        }
    }

    /// The size, in bytes, of a currently-managed address's object.
    pub fn size_of(&mut self, addr: Addr) -> GcResult<usize> {
        let loc = mark::classify(&self.heap, &mut self.spill, &self.types, addr)
            .ok_or(GcError::UnmanagedAddress(addr.as_usize()))?;
        Ok(mark::object_size(&self.heap, &self.types, addr, loc))
    }

    /// Anchor `addr` in the current scope; it becomes a root until the
    /// enclosing scope exits.
    pub fn anchor(&mut self, addr: Addr) -> GcResult<()> {
        if mark::classify(&self.heap, &mut self.spill, &self.types, addr).is_none() {
            return Err(GcError::UnmanagedAddress(addr.as_usize()));
        }
        self.anchors.anchor(addr);
        Ok(())
    }

    /// Snapshot the anchor stack's current depth.
    pub fn enter_scope(&self) -> ScopeMark {
        self.anchors.enter_scope()
    }

    /// Release every anchor made since the matching `enter_scope`.
    pub fn exit_scope(&mut self, mark: ScopeMark) {
        self.anchors.exit_scope(mark);
    }

    /// Suppress collection; returns an opaque token to pass to
    /// [`Self::end_nogc`]. There is no flag to opt out of asserting no
    /// collection is mid-flight, since the collector is fully synchronous
    /// and a collection can never be mid-flight when `begin_nogc` is
    /// called.
    pub fn begin_nogc(&mut self) -> bool {
        self.trigger.begin_nogc()
    }

    /// Restore the no-gc state from `prev` (as returned by
    /// [`Self::begin_nogc`]); runs a deferred collection immediately if
    /// one was requested during the window.
    pub fn end_nogc(&mut self, prev: bool) {
        if self.trigger.end_nogc(prev) {
            self.run_collection();
        }
    }

    /// Request a collection; honoured the next time a trigger threshold
    /// is checked, or immediately if not currently inside a `begin_nogc`
    /// window.
    pub fn request_collect(&mut self) {
        self.trigger.request_collect();
        if !self.trigger.is_gc_disabled() {
            self.run_collection();
        }
    }

    /// Run one full collection now (deferred if `begin_nogc` is active).
    /// Returns the number of objects reclaimed.
    pub fn collect_now(&mut self) -> usize {
        if self.trigger.is_gc_disabled() {
            self.trigger.request_collect();
            return 0;
        }
        self.run_collection()
    }

    /// True iff a collection is currently mid-flight. Always `false`
    /// between calls into `Manager`, since the collector is fully
    /// synchronous and never yields back to the caller mid-cycle; kept
    /// for API parity with clients that check it defensively.
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// One idle tick: advances the spill index's poplar bookkeeping, and
    /// forces a synchronous collection every `NUM_IDLE_CALLS` quiescent
    /// ticks. Returns whether a collection ran.
    pub fn idle(&mut self) -> bool {
        self.spill.update_man_k();
        if self.trigger.idle_tick() {
            self.run_collection();
            true
        } else {
            false
        }
    }

    fn run_collection(&mut self) -> usize {
        self.in_progress = true;

        #[cfg(feature = "gc_logging")]
        tracing::debug!(target: "gc::manager", "collection starting");

        let overflow = mark::run_mark_phase(
            &mut self.heap,
            &mut self.spill,
            &self.types,
            &self.roots,
            &self.anchors,
            &mut self.mark_stack,
            self.debug,
        )
        .unwrap_or_else(|e| {
            #[cfg(feature = "gc_logging")]
            tracing::error!(target: "gc::manager", error = %e, "fatal error during marking");
            panic!("fatal error during marking: {e}");
        });
        if overflow {
            self.mark_stack.double_capacity();
            #[cfg(feature = "gc_logging")]
            tracing::warn!(
                target: "gc::manager",
                new_capacity = self.mark_stack.capacity(),
                "marking stack overflowed; doubled for next cycle"
            );
        }

        let stats = sweep::sweep_now(
            &mut self.heap,
            &mut self.spill,
            &mut self.types,
            self.notify_cb,
            &mut self.blob_layouts,
        );
        self.trigger.reset_after_collect();
        self.in_progress = false;

        #[cfg(feature = "gc_logging")]
        tracing::info!(target: "gc::manager", reclaimed = stats.reclaimed, "collection complete");

        stats.reclaimed
    }

    /// A diagnostic snapshot of current occupancy. `level == 0` reports
    /// only block-heap counts; `level >= 1` additionally scans the spill
    /// index for a per-type breakdown there (an O(n) scan, hence gated).
    pub fn info(&self, level: u8) -> RegistryInfo {
        let blocks_total = self.heap.num_blocks();
        let blocks_in_use = self.heap.records().iter().filter(|r| !r.is_free()).count();

        let mut per_type: Vec<TypeUsage> = self
            .types
            .iter()
            .map(|(id, rec)| TypeUsage {
                type_id: id,
                name: rec.name,
                in_heap: 0,
                spill: 0,
            })
            .collect();
        for rec in self.heap.records() {
            if let Some(id) = rec.type_id {
                per_type[id.0 as usize].in_heap += rec.in_use as usize;
            }
        }

        let mut foreign_imports = 0;
        if level >= 1 {
            for i in self.spill.sweep_range() {
                let slot = self.spill.get(i);
                if slot.is_obsolete() {
                    continue;
                }
                if slot.is_blob() {
                    foreign_imports += 1;
                    continue;
                }
                // SAFETY: every non-blob spill slot carries a header
                // written by the allocator.
                let info = unsafe { read_info_header(slot.addr()) };
                per_type[info.type_id as usize].spill += 1;
            }
        }

        RegistryInfo {
            blocks_total,
            blocks_in_use,
            per_type,
            foreign_imports,
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        // Release every spill allocation still outstanding. The block
        // heap's own `Drop` frees the arena in one shot, but spill
        // objects are individually host-allocated and must be freed one
        // at a time.
        for i in 0..self.spill.len() {
            let slot = self.spill.get(i);
            if slot.is_obsolete() {
                continue;
            }
            let addr = slot.addr();
            let info_nh = if slot.is_blob() {
                None
            } else {
                // SAFETY: every non-blob spill slot carries a header
                // written by the allocator.
                Some(unsafe { read_info_header(addr) }.nh)
            };
            sweep::free_spill_object(addr, slot.is_blob(), info_nh, &mut self.blob_layouts);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cfg() -> GcConfig {
        GcConfig::default().with_num_blocks(4)
    }

    #[test]
    fn alloc_and_collect_reclaims_unrooted_object() {
        let mut mgr = Manager::init(cfg(), None).unwrap();
        let t = mgr.register_type("widget", 32, None, None, None).unwrap();
        let snap = mgr.enter_scope();
        let addr = mgr.alloc(t).unwrap();
        assert!(mgr.is_managed(addr));
        mgr.exit_scope(snap);
        let reclaimed = mgr.collect_now();
        assert_eq!(reclaimed, 1);
        assert!(!mgr.is_managed(addr));
    }

    #[test]
    fn rooted_object_survives_collection() {
        let mut mgr = Manager::init(cfg(), None).unwrap();
        let t = mgr.register_type("widget", 32, None, None, None).unwrap();
        let snap = mgr.enter_scope();
        let addr = mgr.alloc(t).unwrap();
        mgr.exit_scope(snap);

        let mut cell_storage: usize = addr.as_usize();
        let cell = unsafe { RootCell::new(&mut cell_storage as *mut usize).unwrap() };
        mgr.add_root(cell);

        mgr.collect_now();
        assert!(mgr.is_managed(addr));

        mgr.remove_root(cell);
        mgr.collect_now();
        assert!(!mgr.is_managed(addr));
    }

    #[test]
    fn notify_fires_exactly_once_on_reclaim() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        fn on_notify(_addr: Addr) {
            FIRED.fetch_add(1, Ordering::SeqCst);
        }

        let mut mgr = Manager::init(cfg(), Some(on_notify)).unwrap();
        let t = mgr.register_type("widget", 32, None, None, None).unwrap();
        let snap = mgr.enter_scope();
        let addr = mgr.alloc(t).unwrap();
        mgr.notify(addr, true).unwrap();
        mgr.exit_scope(snap);

        mgr.collect_now();
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn finalizer_resurrection_delays_reclaim_by_one_cycle() {
        thread_local! {
            static CALLS: Cell<u32> = Cell::new(0);
        }
        unsafe fn resurrect_once(_addr: Addr, _size: usize) -> bool {
            let n = CALLS.with(|c| {
                let v = c.get() + 1;
                c.set(v);
                v
            });
            n >= 2
        }

        let mut mgr = Manager::init(cfg(), None).unwrap();
        let t = mgr
            .register_type("resurrecting", 32, None, None, Some(resurrect_once))
            .unwrap();
        let snap = mgr.enter_scope();
        let addr = mgr.alloc(t).unwrap();
        mgr.exit_scope(snap);

        assert_eq!(mgr.collect_now(), 0);
        assert!(mgr.is_managed(addr));
        assert_eq!(mgr.collect_now(), 1);
        assert!(!mgr.is_managed(addr));
    }

    #[test]
    fn begin_nogc_defers_requested_collection_until_end() {
        let mut mgr = Manager::init(cfg(), None).unwrap();
        let t = mgr.register_type("widget", 32, None, None, None).unwrap();
        let snap = mgr.enter_scope();
        let addr = mgr.alloc(t).unwrap();
        mgr.exit_scope(snap);

        let prev = mgr.begin_nogc();
        mgr.request_collect();
        assert!(mgr.is_managed(addr));
        mgr.end_nogc(prev);
        assert!(!mgr.is_managed(addr));
    }

    #[test]
    fn manage_imports_and_frees_foreign_allocation() {
        let mut mgr = Manager::init(cfg(), None).unwrap();
        let layout = Layout::from_size_align(16, crate::addr::MIN_HUNKSIZE).unwrap();
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let addr = Addr::new(raw).unwrap();

        let snap = mgr.enter_scope();
        mgr.manage(addr, layout).unwrap();
        assert!(mgr.is_managed(addr));
        mgr.exit_scope(snap);

        mgr.collect_now();
        assert!(!mgr.is_managed(addr));
    }

    #[test]
    fn info_reports_in_heap_counts() {
        let mut mgr = Manager::init(cfg(), None).unwrap();
        let t = mgr.register_type("widget", 32, None, None, None).unwrap();
        let mut cell_storage: usize = 0;
        let cell = unsafe { RootCell::new(&mut cell_storage as *mut usize).unwrap() };
        mgr.add_root(cell);
        for _ in 0..5 {
            let addr = mgr.alloc(t).unwrap();
            cell_storage = addr.as_usize();
            let _ = cell;
        }
        let info = mgr.info(0);
        let usage = info.per_type.iter().find(|u| u.type_id == t).unwrap();
        assert_eq!(usage.in_heap, 5);
    }
}
