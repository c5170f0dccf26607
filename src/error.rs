//! Error types for the memory manager.

use thiserror::Error;

use crate::types::TypeId;

/// Errors the manager can report instead of aborting the process.
///
/// Every variant corresponds to a condition that would otherwise be a
/// fatal, diagnostic-then-abort programmer error, or to the one
/// documented soft-failure path (host allocation retried once after a
/// forced collection). Marking-stack overflow is deliberately absent:
/// it is recovered internally and never surfaces here.
#[derive(Debug, Error)]
pub enum GcError {
    /// A pointer handed to `mark`, `notify`, `remove_root`, `typeof`, or
    /// `sizeof` is not a currently-managed address.
    #[error("address {0:#x} is not a managed address")]
    UnmanagedAddress(usize),

    /// Allocation referenced a type id that was never registered.
    #[error("type id {0:?} is not registered")]
    UndefinedType(TypeId),

    /// A fixed-size type was asked to allocate a variable size, or a
    /// variable-sized type was used with the fixed-size allocation path.
    #[error("type {0:?} size mismatch: {1}")]
    FixedSizeTypeMismatch(TypeId, &'static str),

    /// `Manager::init` was called on a context that is already initialized.
    #[error("manager is already initialized")]
    AlreadyInitialized,

    /// `register_type` was called while profiling is active.
    #[error("cannot register a type while profiling is active")]
    RegisterWhileProfiling,

    /// Requested allocation size exceeds the manager's representable cap.
    #[error("allocation of {0} bytes exceeds the maximum representable size")]
    AllocationTooLarge(usize),

    /// The host allocator failed twice in a row (once, then again after a
    /// forced collection).
    #[error("host allocation of {0} bytes failed after a collection retry")]
    HostAllocationFailed(usize),

    /// A finalizer reported a non-zero error indicator. `FinalizeFn` is a
    /// plain bool return with no separate error channel, so it cannot
    /// distinguish "error" from "resurrect" either; this variant is kept
    /// for API-surface parity rather than constructed anywhere today.
    #[error("finalizer for type {0:?} reported an error")]
    FinalizerError(TypeId),

    /// A duplicate type registration supplied callbacks or a size that
    /// disagree with the prior registration under the same name.
    #[error("type {0:?} already registered with incompatible signature")]
    IncompatibleRedefinition(&'static str),
}

/// Result alias used throughout the crate.
pub type GcResult<T> = Result<T, GcError>;
