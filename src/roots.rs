//! Root table: client-owned cells whose current contents are treated as
//! GC roots.

use rustc_hash::FxHashSet;
use std::ptr::NonNull;

/// A client-owned, pointer-sized cell. Its contents (read via
/// [`RootCell::get`]) is either zero (no root currently held) or a
/// managed address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootCell(NonNull<usize>);

impl RootCell {
    /// Wrap a raw cell pointer.
    ///
    /// # Safety
    /// `cell` must be valid for reads for the lifetime it is registered
    /// as a root.
    pub unsafe fn new(cell: *mut usize) -> Option<Self> {
        NonNull::new(cell).map(RootCell)
    }

    /// Current contents of the cell, as a raw address (0 means no root).
    #[inline]
    pub fn get(self) -> usize {
        unsafe { *self.0.as_ptr() }
    }

    /// Raw pointer identity, used for dedup.
    #[inline]
    fn key(self) -> usize {
        self.0.as_ptr() as usize
    }
}

/// The root table: a deduplicated, insertion-ordered set of client cells.
pub struct RootTable {
    cells: Vec<RootCell>,
    seen: FxHashSet<usize>,
}

impl RootTable {
    /// Build an empty table with the given initial capacity.
    pub fn new(min_roots: usize) -> Self {
        Self {
            cells: Vec::with_capacity(min_roots),
            seen: FxHashSet::default(),
        }
    }

    /// Register `cell` as a root. Duplicate registration is a no-op.
    /// Returns `true` if this call actually added a new entry.
    pub fn add_root(&mut self, cell: RootCell) -> bool {
        if self.seen.insert(cell.key()) {
            self.cells.push(cell);
            true
        } else {
            false
        }
    }

    /// Unregister `cell`. Returns `true` if it was present.
    pub fn remove_root(&mut self, cell: RootCell) -> bool {
        if self.seen.remove(&cell.key()) {
            self.cells.retain(|c| c.key() != cell.key());
            true
        } else {
            false
        }
    }

    /// Number of registered root cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Iterate over the registered cells, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = RootCell> + '_ {
        self.cells.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_round_trip() {
        let mut table = RootTable::new(4);
        let mut cell_storage: usize = 0;
        let cell = unsafe { RootCell::new(&mut cell_storage as *mut usize).unwrap() };
        assert!(table.add_root(cell));
        assert_eq!(table.len(), 1);
        assert!(table.remove_root(cell));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn duplicate_add_is_noop() {
        let mut table = RootTable::new(4);
        let mut cell_storage: usize = 0;
        let cell = unsafe { RootCell::new(&mut cell_storage as *mut usize).unwrap() };
        assert!(table.add_root(cell));
        assert!(!table.add_root(cell));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn cell_reads_current_contents() {
        let mut cell_storage: usize = 0;
        let cell = unsafe { RootCell::new(&mut cell_storage as *mut usize).unwrap() };
        assert_eq!(cell.get(), 0);
        cell_storage = 0x2000;
        assert_eq!(cell.get(), 0x2000);
    }
}
