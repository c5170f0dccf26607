//! Type registry: stable type ids, per-type callbacks, and the allocator
//! cursors cached per type.

use rustc_hash::FxHashMap;

use crate::addr::{fix_size, Addr};
use crate::config::MIN_TYPES;
use crate::error::{GcError, GcResult};

/// Callback invoked on a freshly handed-out region before it is returned
/// to the client, to zero or otherwise initialise it.
pub type ClearFn = unsafe fn(Addr, usize);

/// Callback invoked on a live object during marking. `mark_child` must be
/// called once per outgoing reference the object holds; the marking
/// engine supplies an implementation that pushes onto the mark stack.
pub type MarkFn = unsafe fn(Addr, usize, &mut dyn FnMut(Addr));

/// Callback invoked before reclamation. Returns `true` if reclamation may
/// proceed, `false` if the finalizer resurrected the object (it must not
/// be reclaimed this cycle).
pub type FinalizeFn = unsafe fn(Addr, usize) -> bool;

/// Stable small-integer type identifier, assigned in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

/// Internal type ids, pre-registered by [`TypeRegistry::new`] before any
/// client call to `register_type`.
pub mod internal {
    use super::TypeId;

    /// Reserved id for the anchor stack's own header object.
    pub const STACK: TypeId = TypeId(0);
    /// Anchor stack chunk, one block in size.
    pub const STACK_CHUNK: TypeId = TypeId(1);
    /// Fixed 8-byte untyped blob bucket.
    pub const BLOB8: TypeId = TypeId(2);
    /// Fixed 16-byte untyped blob bucket.
    pub const BLOB16: TypeId = TypeId(3);
    /// Fixed 32-byte untyped blob bucket.
    pub const BLOB32: TypeId = TypeId(4);
    /// Fixed 64-byte untyped blob bucket.
    pub const BLOB64: TypeId = TypeId(5);
    /// Fixed 128-byte untyped blob bucket.
    pub const BLOB128: TypeId = TypeId(6);
    /// Fixed 256-byte untyped blob bucket.
    pub const BLOB256: TypeId = TypeId(7);
    /// Variable-sized untyped blob.
    pub const BLOB: TypeId = TypeId(8);
    /// Variable-sized array of references ("refs").
    pub const REFS: TypeId = TypeId(9);

    /// Ordered bucket sizes for the fixed blob types, smallest first.
    pub const BLOB_BUCKETS: [(TypeId, usize); 6] = [
        (BLOB8, 8),
        (BLOB16, 16),
        (BLOB32, 32),
        (BLOB64, 64),
        (BLOB128, 128),
        (BLOB256, 256),
    ];

    /// The first id available for client registrations.
    pub const FIRST_CLIENT_ID: u32 = 10;
}

/// Per-type allocator cursors: the address to try next within the type's
/// current block, the end of that block's usable range, and the next
/// block index to scan once the current block fills.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocCursor {
    /// Next address to try within the current block, or `None` if the
    /// type has never claimed a block.
    pub current_a: Option<usize>,
    /// One past the last valid slot start in the current block.
    pub current_amax: usize,
    /// Next block index to scan on rotation.
    pub next_b: usize,
}

/// A registered type: its callbacks, declared size, and cached allocator
/// state.
pub struct TypeRecord {
    /// Unique display name.
    pub name: &'static str,
    /// Declared size in bytes, already hunk-aligned. Zero means
    /// variable-sized.
    pub size: usize,
    /// Optional clear callback.
    pub clear: Option<ClearFn>,
    /// Optional mark callback.
    pub mark: Option<MarkFn>,
    /// Optional finalize callback.
    pub finalize: Option<FinalizeFn>,
    /// Cached allocator cursor for the in-heap block allocator.
    pub cursor: AllocCursor,
}

impl TypeRecord {
    /// True if this type is variable-sized (`size == 0`).
    pub fn is_variable(&self) -> bool {
        self.size == 0
    }
}

/// The type registry. Assigns ids in registration order and pre-registers
/// the ten internal types described in `types::internal` before any
/// client registration.
pub struct TypeRegistry {
    records: Vec<TypeRecord>,
    by_name: FxHashMap<&'static str, TypeId>,
    profiling: bool,
}

impl TypeRegistry {
    /// Build a registry with the internal types pre-registered.
    pub fn new(min_types: usize) -> Self {
        let mut reg = Self {
            records: Vec::with_capacity(min_types.max(MIN_TYPES)),
            by_name: FxHashMap::default(),
            profiling: false,
        };
        reg.register_internal_types();
        reg
    }

    fn push(
        &mut self,
        name: &'static str,
        size: usize,
        clear: Option<ClearFn>,
        mark: Option<MarkFn>,
        finalize: Option<FinalizeFn>,
    ) -> TypeId {
        let id = TypeId(self.records.len() as u32);
        self.records.push(TypeRecord {
            name,
            size,
            clear,
            mark,
            finalize,
            cursor: AllocCursor::default(),
        });
        self.by_name.insert(name, id);
        id
    }

    fn register_internal_types(&mut self) {
        use crate::config::BLOCKSIZE;
        use crate::mark::{clear_refs, mark_refs_payload};

        // These two ids are reserved purely so that client types start at
        // `internal::FIRST_CLIENT_ID`. The anchor stack's own bookkeeping
        // lives off-heap (see anchor.rs), so they carry no callbacks and
        // are never actually allocated against.
        let id = self.push("gc_stack", 0, None, None, None);
        debug_assert_eq!(id, internal::STACK);

        let id = self.push("gc_stack_chunk", BLOCKSIZE, None, None, None);
        debug_assert_eq!(id, internal::STACK_CHUNK);

        for (want_id, size) in internal::BLOB_BUCKETS {
            let name: &'static str = match size {
                8 => "blob8",
                16 => "blob16",
                32 => "blob32",
                64 => "blob64",
                128 => "blob128",
                256 => "blob256",
                _ => unreachable!(),
            };
            let id = self.push(name, size, None, None, None);
            debug_assert_eq!(id, want_id);
        }

        let id = self.push("blob", 0, None, None, None);
        debug_assert_eq!(id, internal::BLOB);

        let id = self.push(
            "refs",
            0,
            Some(clear_refs),
            Some(mark_refs_payload),
            None,
        );
        debug_assert_eq!(id, internal::REFS);

        debug_assert_eq!(self.records.len() as u32, internal::FIRST_CLIENT_ID);
    }

    /// Register a type, or return the existing id if `name` was already
    /// registered with an identical signature.
    pub fn register_type(
        &mut self,
        name: &'static str,
        size: usize,
        clear: Option<ClearFn>,
        mark: Option<MarkFn>,
        finalize: Option<FinalizeFn>,
    ) -> GcResult<TypeId> {
        if self.profiling {
            return Err(GcError::RegisterWhileProfiling);
        }
        let size = fix_size(size);
        if let Some(&existing) = self.by_name.get(name) {
            let rec = self.get(existing);
            let matches = rec.size == size
                && rec.clear.map(|f| f as usize) == clear.map(|f| f as usize)
                && rec.mark.map(|f| f as usize) == mark.map(|f| f as usize)
                && rec.finalize.map(|f| f as usize) == finalize.map(|f| f as usize);
            if matches {
                return Ok(existing);
            }
            return Err(GcError::IncompatibleRedefinition(name));
        }
        Ok(self.push(name, size, clear, mark, finalize))
    }

    /// Begin a profiling session; registration is rejected while active.
    pub fn set_profiling(&mut self, on: bool) {
        self.profiling = on;
    }

    /// Number of registered types, including internal ones.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if the registry holds no types (never the case after `new`).
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a type by id, panicking if the id is out of range. Callers
    /// that accept externally-supplied ids should use [`Self::try_get`].
    pub fn get(&self, id: TypeId) -> &TypeRecord {
        &self.records[id.0 as usize]
    }

    /// Mutable lookup by id.
    pub fn get_mut(&mut self, id: TypeId) -> &mut TypeRecord {
        &mut self.records[id.0 as usize]
    }

    /// Look up a type by id, returning `None` (rather than panicking) if
    /// it is out of range.
    pub fn try_get(&self, id: TypeId) -> GcResult<&TypeRecord> {
        self.records
            .get(id.0 as usize)
            .ok_or(GcError::UndefinedType(id))
    }

    /// Iterate over all registered types with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &TypeRecord)> {
        self.records
            .iter()
            .enumerate()
            .map(|(i, r)| (TypeId(i as u32), r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_types_preregistered_in_order() {
        let reg = TypeRegistry::new(MIN_TYPES);
        assert_eq!(reg.len() as u32, internal::FIRST_CLIENT_ID);
        assert_eq!(reg.get(internal::STACK).name, "gc_stack");
        assert_eq!(reg.get(internal::STACK_CHUNK).name, "gc_stack_chunk");
        assert_eq!(reg.get(internal::BLOB8).size, 8);
        assert_eq!(reg.get(internal::BLOB256).size, 256);
        assert!(reg.get(internal::BLOB).is_variable());
        assert!(reg.get(internal::REFS).is_variable());
    }

    #[test]
    fn duplicate_registration_with_same_signature_returns_same_id() {
        let mut reg = TypeRegistry::new(MIN_TYPES);
        let a = reg.register_type("widget", 32, None, None, None).unwrap();
        let b = reg.register_type("widget", 32, None, None, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn duplicate_registration_with_different_size_errors() {
        let mut reg = TypeRegistry::new(MIN_TYPES);
        reg.register_type("widget", 32, None, None, None).unwrap();
        let err = reg.register_type("widget", 64, None, None, None);
        assert!(matches!(err, Err(GcError::IncompatibleRedefinition(_))));
    }

    #[test]
    fn registration_rejected_while_profiling() {
        let mut reg = TypeRegistry::new(MIN_TYPES);
        reg.set_profiling(true);
        let err = reg.register_type("widget", 32, None, None, None);
        assert!(matches!(err, Err(GcError::RegisterWhileProfiling)));
    }

    #[test]
    fn size_rounds_up_to_hunk() {
        let mut reg = TypeRegistry::new(MIN_TYPES);
        let id = reg.register_type("odd", 9, None, None, None).unwrap();
        assert_eq!(reg.get(id).size, 16);
    }
}
