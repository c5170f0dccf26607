//! The managed (spill) index: a poplar-sorted array of tagged pointers to
//! out-of-heap objects, plus the hidden info header used to recover a
//! spill object's type and size.
//!
//! Poplar sort is used instead of a conventional sorted array because
//! the index is append-mostly: new spill allocations are appended to an
//! unsorted tail, and a full re-sort only happens for the prefix that
//! participates in lookups during the next collection. A poplar is an
//! implicit max-heap of size `2^k - 1`; the index is a sequence of
//! poplars of strictly decreasing size, each either known-sorted or a
//! valid max-heap. See `update_man_k`/`sort_poplar` below, ported
//! directly from the reference implementation's incremental
//! insertion-and-sift algorithm.

use crate::addr::{Addr, MIN_HUNKSIZE};
use crate::config::MAX_POPLAR;
use crate::types::TypeId;

const LIVE_OR_OBSOLETE: usize = 0b001;
const NOTIFY: usize = 0b010;
const BLOB: usize = 0b100;
const TAG_MASK: usize = 0b111;

/// A tagged entry in the managed index: an 8-byte-aligned address with
/// three flag bits packed into the low bits (legal because the address
/// itself is hunk-aligned). The live and obsolete meanings share the
/// same bit — legal because they are never both meaningful for the same
/// entry at the same time (obsolete only matters between collections;
/// live only matters during one).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SpillSlot(usize);

impl SpillSlot {
    /// Build a fresh, non-live, non-notify entry for `addr`.
    pub fn new(addr: Addr, blob: bool) -> Self {
        let mut v = addr.as_usize();
        if blob {
            v |= BLOB;
        }
        SpillSlot(v)
    }

    /// The clean (untagged) address.
    #[inline]
    pub fn addr(self) -> Addr {
        unsafe { Addr::new_unchecked((self.0 & !TAG_MASK) as *mut u8) }
    }

    #[inline]
    pub fn is_live(self) -> bool {
        self.0 & LIVE_OR_OBSOLETE != 0
    }

    #[inline]
    pub fn is_obsolete(self) -> bool {
        self.is_live()
    }

    #[inline]
    pub fn is_notify(self) -> bool {
        self.0 & NOTIFY != 0
    }

    #[inline]
    pub fn is_blob(self) -> bool {
        self.0 & BLOB != 0
    }

    #[inline]
    pub fn set_live(&mut self, on: bool) {
        if on {
            self.0 |= LIVE_OR_OBSOLETE;
        } else {
            self.0 &= !LIVE_OR_OBSOLETE;
        }
    }

    #[inline]
    pub fn mark_obsolete(&mut self) {
        self.0 |= LIVE_OR_OBSOLETE;
    }

    #[inline]
    pub fn set_notify(&mut self, on: bool) {
        if on {
            self.0 |= NOTIFY;
        } else {
            self.0 &= !NOTIFY;
        }
    }
}

/// Hidden prefix placed before every non-blob spill allocation. Occupies
/// exactly one minimum hunk.
#[repr(C)]
pub struct InfoHeader {
    /// Type id of the spill object.
    pub type_id: u32,
    /// Size of the object, in multiples of `MIN_HUNKSIZE`.
    pub nh: u32,
}

const _: () = assert!(std::mem::size_of::<InfoHeader>() == MIN_HUNKSIZE);

/// Convert a header address (the start of the host allocation) to the
/// payload address handed to the client.
///
/// # Safety
/// `header_addr` must point to the start of an allocation at least
/// `MIN_HUNKSIZE` bytes long.
pub unsafe fn seal(header_addr: Addr) -> Addr {
    unsafe { header_addr.add(MIN_HUNKSIZE) }
}

/// Convert a payload address back to its header address.
///
/// # Safety
/// `payload_addr` must have been produced by [`seal`].
pub unsafe fn unseal(payload_addr: Addr) -> Addr {
    unsafe { payload_addr.sub(MIN_HUNKSIZE) }
}

/// Write the info header at `header_addr`.
///
/// # Safety
/// `header_addr` must be valid for a write of `InfoHeader`.
pub unsafe fn write_info_header(header_addr: Addr, type_id: TypeId, nh: u32) {
    unsafe {
        (header_addr.as_ptr() as *mut InfoHeader).write(InfoHeader { type_id: type_id.0, nh });
    }
}

/// Read the info header belonging to `payload_addr`.
///
/// # Safety
/// `payload_addr` must have been produced by [`seal`] over a valid
/// header.
pub unsafe fn read_info_header(payload_addr: Addr) -> InfoHeader {
    let header_addr = unsafe { unseal(payload_addr) };
    unsafe { (header_addr.as_ptr() as *const InfoHeader).read() }
}

fn sift(managed: &mut [SpillSlot], p: isize, q: isize) {
    if q - p > 1 {
        let mut x = q;
        let m = (p + q) / 2;
        if managed[(q - 1) as usize].addr().as_usize() > managed[x as usize].addr().as_usize() {
            x = q - 1;
        }
        if managed[m as usize].addr().as_usize() > managed[x as usize].addr().as_usize() {
            x = m;
        }
        if x != q {
            managed.swap(x as usize, q as usize);
            if x == q - 1 {
                sift(managed, m, x);
            } else {
                sift(managed, p, x);
            }
        }
    }
}

/// The managed (spill) index.
pub struct ManagedIndex {
    managed: Vec<SpillSlot>,
    /// Index of the last occupied slot, or -1 when empty.
    man_last: isize,
    /// Index up to which the array is pinned sorted for the in-progress
    /// collection, or -1 outside a collection.
    man_k: isize,
    /// Number of active poplars.
    man_t: usize,
    /// Root index of poplar `n` is `poplar_roots[n] + 1 ..= poplar_roots[n+1]`.
    poplar_roots: [isize; MAX_POPLAR + 2],
    poplar_sorted: [bool; MAX_POPLAR],
    is_compact: bool,
    min_size: usize,
    collect_in_progress: bool,
}

impl ManagedIndex {
    /// Build an empty index with the given initial capacity.
    pub fn new(min_size: usize) -> Self {
        let mut poplar_roots = [-1isize; MAX_POPLAR + 2];
        poplar_roots[0] = -1;
        Self {
            managed: Vec::with_capacity(min_size),
            man_last: -1,
            man_k: -1,
            man_t: 0,
            poplar_roots,
            poplar_sorted: [false; MAX_POPLAR],
            is_compact: true,
            min_size,
            collect_in_progress: false,
        }
    }

    /// Number of live-or-obsolete entries currently stored (includes the
    /// unsorted tail).
    pub fn len(&self) -> usize {
        (self.man_last + 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.man_last < 0
    }

    /// Append `slot` to the tail in amortised O(1).
    pub fn add_managed(&mut self, slot: SpillSlot) -> usize {
        self.managed.push(slot);
        self.man_last += 1;
        self.is_compact = false;
        self.man_last as usize
    }

    /// Read-only access by raw index (as returned by `find_managed`).
    pub fn get(&self, i: usize) -> SpillSlot {
        self.managed[i]
    }

    /// Mutable access by raw index.
    pub fn get_mut(&mut self, i: usize) -> &mut SpillSlot {
        &mut self.managed[i]
    }

    /// Iterate indices `0..=man_k` (the portion pinned sorted for the
    /// in-progress collection) if a collection is in progress, else the
    /// whole array. Mirrors the `DO_MANAGED` loop bound.
    pub fn sweep_range(&self) -> std::ops::RangeInclusive<usize> {
        let last = if self.collect_in_progress {
            self.man_k
        } else {
            self.man_last
        };
        if last < 0 {
            #[allow(clippy::reversed_empty_ranges)]
            return 1..=0;
        }
        0..=(last as usize)
    }

    /// Promote the unsorted tail into poplars, maintaining the poplar
    /// invariant (incremental insertion with sift).
    pub fn update_man_k(&mut self) {
        debug_assert!(!self.collect_in_progress);
        while self.man_k < self.man_last {
            self.man_k += 1;
            if self.man_t >= 2
                && self.man_k - 1 + self.poplar_roots[self.man_t - 2]
                    == 2 * self.poplar_roots[self.man_t - 1]
            {
                self.man_t -= 1;
                self.poplar_roots[self.man_t] = self.man_k;
                sift(
                    &mut self.managed,
                    self.poplar_roots[self.man_t - 1],
                    self.man_k,
                );
                self.poplar_sorted[self.man_t - 1] = false;
            } else {
                self.man_t += 1;
                self.poplar_roots[self.man_t] = self.man_k;
                self.poplar_sorted[self.man_t - 1] = true;
            }
        }
    }

    /// Sort poplar `n` in place (heapsort-style: repeatedly extract the
    /// max root and re-sift).
    pub fn sort_poplar(&mut self, n: usize) {
        debug_assert!(!self.collect_in_progress);
        if self.poplar_sorted[n] {
            return;
        }
        let mut r = [0isize; MAX_POPLAR + 1];
        let mut t: usize = 1;
        r[0] = self.poplar_roots[n];
        r[1] = self.poplar_roots[n + 1];

        let mut k = r[1] + 1;
        while {
            k -= 1;
            k > r[0]
        } {
            let mut m = t;
            for j in 1..t {
                if self.managed[r[m] as usize].addr().as_usize()
                    < self.managed[r[j] as usize].addr().as_usize()
                {
                    m = j;
                }
            }
            if m != t {
                self.managed.swap(r[m] as usize, r[t] as usize);
                sift(&mut self.managed, r[m - 1], r[m]);
            }
            if r[t - 1] == k - 1 {
                t -= 1;
            } else {
                r[t] = (r[t - 1] + k) / 2;
                t += 1;
                r[t] = k - 1;
            }
        }
        self.poplar_sorted[n] = true;
    }

    /// Binary search for `addr` within the sorted range `[l, r)` of
    /// `managed`.
    fn bsearch(&self, addr: usize, mut l: isize, mut r: isize) -> Option<usize> {
        while r - l > 1 {
            let n = (r + l) / 2;
            if addr >= self.managed[n as usize].addr().as_usize() {
                l = n;
            } else {
                r = n;
            }
        }
        if self.managed[l as usize].addr().as_usize() == addr {
            return Some(l as usize);
        }
        if l < self.man_k && self.managed[(l + 1) as usize].addr().as_usize() == addr {
            return Some((l + 1) as usize);
        }
        None
    }

    /// Locate `addr` in the index, sorting poplars on demand, then
    /// scanning the unsorted tail. Returns the raw index regardless of
    /// obsolete status; callers that care should check
    /// `get(i).is_obsolete()`.
    pub fn find_managed(&mut self, addr: Addr) -> Option<usize> {
        let a = addr.as_usize();
        let mut found = None;
        for n in 0..self.man_t {
            if !self.poplar_sorted[n] {
                self.sort_poplar(n);
            }
            if let Some(i) = self.bsearch(a, self.poplar_roots[n], self.poplar_roots[n + 1]) {
                found = Some(i);
                break;
            }
        }
        if found.is_none() || self.collect_in_progress {
            let mut n = self.man_last;
            while n > self.man_k {
                if self.managed[n as usize].addr().as_usize() == a {
                    found = Some(n as usize);
                    break;
                }
                n -= 1;
            }
        }
        found
    }

    /// Remove obsolete entries, rebuild poplar roots from the resulting
    /// prefix length via the canonical binary decomposition, and shrink
    /// the backing storage when occupancy drops below 25% of capacity.
    pub fn compact_managed(&mut self) {
        debug_assert!(!self.collect_in_progress);
        if self.is_compact {
            return;
        }
        debug_assert!(self.man_t > 0 || self.man_last < 0);

        if self.man_last < 0 {
            self.is_compact = true;
            return;
        }

        self.man_k = self.poplar_roots[1];
        let mut n: isize = 0;
        let mut i: isize = 0;
        while i <= self.man_k {
            if !self.managed[i as usize].is_obsolete() {
                self.managed[n as usize] = self.managed[i as usize];
                n += 1;
            }
            i += 1;
        }
        self.man_k = n - 1;
        while i <= self.man_last {
            if !self.managed[i as usize].is_obsolete() {
                self.managed[n as usize] = self.managed[i as usize];
                n += 1;
            }
            i += 1;
        }
        self.man_last = n - 1;
        self.managed.truncate((self.man_last + 1).max(0) as usize);

        // Rebuild poplars from the binary decomposition of the sorted
        // prefix length; only valid because that prefix was sorted.
        let mut remaining = self.man_k + 1;
        self.man_t = 0;
        self.poplar_roots[0] = -1;
        let mut m: isize = (1isize << (MAX_POPLAR - 1)) - 1;
        while remaining > 0 {
            if remaining >= m {
                self.poplar_roots[self.man_t + 1] = self.poplar_roots[self.man_t] + m;
                self.poplar_sorted[self.man_t] = true;
                self.man_t += 1;
                remaining -= m;
            } else {
                m >>= 1;
            }
        }

        if (self.man_last as i64) * 4 < self.managed.capacity() as i64
            && self.managed.capacity() > self.min_size
        {
            self.managed.shrink_to((self.managed.capacity() / 2).max(self.min_size));
        }
        self.is_compact = true;
    }

    /// Pin the sorted prefix for a collection prologue: sort every
    /// poplar and fix `man_k = man_last` so allocations made during the
    /// cycle land in an excluded, unsorted suffix.
    pub fn begin_collection(&mut self) {
        self.update_man_k();
        for n in 0..self.man_t {
            self.sort_poplar(n);
        }
        debug_assert_eq!(self.man_k, self.man_last);
        self.collect_in_progress = true;
    }

    /// Clear collection-in-progress state at the epilogue.
    pub fn end_collection(&mut self) {
        self.collect_in_progress = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr_at(n: usize) -> Addr {
        unsafe { Addr::new_unchecked((0x1000 + n * 8) as *mut u8) }
    }

    #[test]
    fn add_and_find_roundtrip() {
        let mut idx = ManagedIndex::new(16);
        let mut inserted = Vec::new();
        for i in 0..40 {
            let a = addr_at(i * 3 + 1);
            idx.add_managed(SpillSlot::new(a, false));
            inserted.push(a);
        }
        idx.begin_collection();
        for a in &inserted {
            let i = idx.find_managed(*a).expect("inserted address must be found");
            assert_eq!(idx.get(i).addr(), *a);
        }
        let missing = addr_at(9999);
        assert!(idx.find_managed(missing).is_none());
    }

    #[test]
    fn obsolete_entries_removed_by_compact() {
        let mut idx = ManagedIndex::new(16);
        let mut addrs = Vec::new();
        for i in 0..20 {
            let a = addr_at(i * 5 + 1);
            idx.add_managed(SpillSlot::new(a, false));
            addrs.push(a);
        }
        idx.begin_collection();
        // mark every other entry obsolete
        for i in (0..idx.len()).step_by(2) {
            idx.get_mut(i).mark_obsolete();
        }
        idx.end_collection();
        idx.compact_managed();
        for i in 0..idx.len() {
            assert!(!idx.get(i).is_obsolete());
        }
    }

    #[test]
    fn seal_unseal_roundtrip() {
        let mut buf = [0u8; 16];
        let header = Addr::new(buf.as_mut_ptr()).unwrap();
        unsafe {
            write_info_header(header, TypeId(10), 2);
            let payload = seal(header);
            let back = unseal(payload);
            assert_eq!(back.as_usize(), header.as_usize());
            let info = read_info_header(payload);
            assert_eq!(info.type_id, 10);
            assert_eq!(info.nh, 2);
        }
    }
}
