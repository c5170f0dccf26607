//! The small-object heap: a contiguous, block-aligned arena plus the
//! block records and bitmap layered over it.

use std::alloc::{alloc_zeroed, dealloc, Layout};

use crate::addr::{Addr, MIN_HUNKSIZE};
use crate::bitmap::HeapBitmap;
use crate::block::BlockRecord;
use crate::config::BLOCKSIZE;

/// Offset, from a block's base, of the last valid slot start for a type
/// of the given `size`.
#[inline]
pub fn amax_offset(size: usize) -> usize {
    (BLOCKSIZE / size - 1) * size
}

/// The paged small-object heap: a single large arena divided into
/// `BLOCKSIZE` blocks, each either free or owned by one type.
pub struct BlockHeap {
    arena: *mut u8,
    layout: Layout,
    len: usize,
    num_blocks: usize,
    records: Vec<BlockRecord>,
    bitmap: HeapBitmap,
}

// SAFETY: `BlockHeap` is only ever touched through `&mut Manager`; the
// manager itself is not `Sync` (see manager.rs), so there is no
// concurrent access to guard against here.
unsafe impl Send for BlockHeap {}

impl BlockHeap {
    /// Allocate a heap of `num_blocks` blocks, zero-initialised.
    pub fn new(num_blocks: usize) -> Self {
        let len = num_blocks * BLOCKSIZE;
        let layout = Layout::from_size_align(len, BLOCKSIZE).expect("valid heap layout");
        // SAFETY: layout has non-zero size (num_blocks is always >= MIN_NUMBLOCKS > 0).
        let arena = unsafe { alloc_zeroed(layout) };
        assert!(!arena.is_null(), "failed to allocate small-object heap");
        Self {
            arena,
            layout,
            len,
            num_blocks,
            records: vec![BlockRecord::default(); num_blocks],
            bitmap: HeapBitmap::new(len),
        }
    }

    /// Base address of the arena.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.arena
    }

    /// Total size of the arena in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Number of blocks.
    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// True if `addr` falls within the arena.
    #[inline]
    pub fn contains(&self, addr: Addr) -> bool {
        let a = addr.as_usize();
        let base = self.arena as usize;
        a >= base && a < base + self.len
    }

    /// Index of the block containing `addr`. Caller must ensure
    /// `contains(addr)`.
    #[inline]
    pub fn block_index_of(&self, addr: Addr) -> usize {
        debug_assert!(self.contains(addr));
        (addr.as_usize() - self.arena as usize) / BLOCKSIZE
    }

    /// Base address of block `idx`.
    #[inline]
    pub fn block_base(&self, idx: usize) -> Addr {
        debug_assert!(idx < self.num_blocks);
        unsafe { Addr::new_unchecked(self.arena.add(idx * BLOCKSIZE)) }
    }

    /// Hunk index of `addr`, relative to the arena base. Caller must
    /// ensure `contains(addr)`.
    #[inline]
    pub fn hunk_index_of(&self, addr: Addr) -> usize {
        debug_assert!(self.contains(addr));
        (addr.as_usize() - self.arena as usize) / MIN_HUNKSIZE
    }

    /// Address of hunk `hunk`, relative to the arena base.
    #[inline]
    pub fn addr_of_hunk(&self, hunk: usize) -> Addr {
        unsafe { Addr::new_unchecked(self.arena.add(hunk * MIN_HUNKSIZE)) }
    }

    /// Shared access to the block record table.
    #[inline]
    pub fn records(&self) -> &[BlockRecord] {
        &self.records
    }

    /// Mutable access to the block record table.
    #[inline]
    pub fn records_mut(&mut self) -> &mut [BlockRecord] {
        &mut self.records
    }

    /// Shared access to the heap bitmap.
    #[inline]
    pub fn bitmap(&self) -> &HeapBitmap {
        &self.bitmap
    }

    /// Mutable access to the heap bitmap.
    #[inline]
    pub fn bitmap_mut(&mut self) -> &mut HeapBitmap {
        &mut self.bitmap
    }

    /// Scan block `idx` (owned by a type of the given `size`) starting at
    /// byte offset `from_offset` within the block for the first slot
    /// whose managed bit is clear. Returns the slot's address if found.
    pub fn find_free_slot_in_block(
        &self,
        idx: usize,
        size: usize,
        from_offset: usize,
    ) -> Option<Addr> {
        let base = self.block_base(idx);
        let mut offset = from_offset;
        while offset + size <= BLOCKSIZE {
            let slot = unsafe { base.add(offset) };
            let hunk = self.hunk_index_of(slot);
            if !self.bitmap.is_managed(hunk) {
                return Some(slot);
            }
            offset += size;
        }
        None
    }

    /// Iterate over every slot's address within block `idx`, given the
    /// type's `size`, regardless of whether it is currently managed. Used
    /// by the sweeper, which already knows the block's type and size.
    pub fn for_each_slot_in_block(&self, idx: usize, size: usize, mut f: impl FnMut(Addr)) {
        let base = self.block_base(idx);
        let mut offset = 0usize;
        while offset + size <= BLOCKSIZE {
            f(unsafe { base.add(offset) });
            offset += size;
        }
    }
}

impl Drop for BlockHeap {
    fn drop(&mut self) {
        // SAFETY: `arena` was allocated with `layout` in `new` and is not
        // aliased elsewhere once `BlockHeap` is dropped.
        unsafe { dealloc(self.arena, self.layout) };
    }
}
