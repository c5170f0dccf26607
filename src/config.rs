//! Tunable constants and the configuration struct passed to `Manager::init`.

/// Minimum allocation granule, in bytes.
pub const MIN_HUNKSIZE: usize = crate::addr::MIN_HUNKSIZE;

/// Block (page) size in bytes.
pub const BLOCKSIZE: usize = 4096;

/// Minimum number of blocks in the small-object heap.
pub const MIN_NUMBLOCKS: usize = 0x015;

/// Minimum size of the type registry.
pub const MIN_TYPES: usize = 0x100;

/// Minimum initial capacity of the managed (spill) index.
pub const MIN_MANAGED: usize = 0x40000;

/// Minimum initial capacity of the root table.
pub const MIN_ROOTS: usize = 0x100;

/// Initial marking-stack capacity.
pub const MIN_STACK: usize = 0x1000;

/// Maximum number of poplars the managed index supports.
pub const MAX_POPLAR: usize = 31;

/// Number of `idle()` calls between forced collections when the manager
/// has otherwise been quiescent.
pub const NUM_IDLE_CALLS: u32 = 100;

/// Hard cap on the small-object heap's total size: 1 GiB.
pub const MAX_HEAP_BYTES: usize = 1 << 30;

/// Threshold cap on blocks allocated between collections.
pub const MAX_BLOCKS: usize = 150;

/// Threshold cap on bytes allocated between collections.
pub const MAX_VOLUME: usize = 0x800000 * std::mem::size_of::<usize>();

/// Configuration for [`crate::manager::Manager::init`].
///
/// A plain tunables struct with a `Default` impl and `with_*` builder
/// methods, rather than a positional `init(npages, notify_cb, log)` call.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Number of `BLOCKSIZE` pages to reserve for the small-object heap.
    /// Clamped up to [`MIN_NUMBLOCKS`] and the heap is capped overall at
    /// [`MAX_HEAP_BYTES`].
    pub num_blocks: usize,
    /// Initial type registry capacity.
    pub min_types: usize,
    /// Initial managed (spill) index capacity.
    pub min_managed: usize,
    /// Initial root table capacity.
    pub min_roots: usize,
    /// Initial marking-stack capacity.
    pub min_stack: usize,
    /// Whether `set_debug` starts enabled: gates per-allocation/per-mark
    /// `tracing::trace!` chatter (also requires the `gc_logging` feature)
    /// and upgrades a couple of invariant checks from `debug_assert!` to
    /// `assert!`.
    pub debug: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            num_blocks: MIN_NUMBLOCKS,
            min_types: MIN_TYPES,
            min_managed: MIN_MANAGED,
            min_roots: MIN_ROOTS,
            min_stack: MIN_STACK,
            debug: false,
        }
    }
}

impl GcConfig {
    /// Start from defaults with a given number of blocks.
    pub fn with_num_blocks(mut self, num_blocks: usize) -> Self {
        self.num_blocks = num_blocks.max(MIN_NUMBLOCKS);
        self
    }

    /// Start from defaults with a given initial marking-stack capacity.
    /// Primarily useful for tests exercising the overflow-recovery path.
    pub fn with_min_stack(mut self, min_stack: usize) -> Self {
        self.min_stack = min_stack.max(1);
        self
    }

    /// Start from defaults with debug assertions/tracing enabled.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Heap size in bytes implied by this configuration, before the
    /// 1 GiB cap is applied.
    pub fn heap_bytes(&self) -> usize {
        (self.num_blocks.max(MIN_NUMBLOCKS) * BLOCKSIZE).min(MAX_HEAP_BYTES)
    }
}
