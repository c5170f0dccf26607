//! # Precise GC
//!
//! A conservative-free, type-aware, precise tracing memory manager.
//!
//! Every managed object belongs to a registered type carrying optional
//! `clear`/`mark`/`finalize` callbacks; the collector never scans memory
//! for bit patterns that merely look like pointers — it only follows
//! edges a type's own `mark` callback reports. Small, fixed-size objects
//! live in a block-paged heap; large or variable-sized objects spill to
//! the host allocator behind a poplar-sorted index.
//!
//! ## Design
//!
//! - **Block heap** (`heap`, `block`, `bitmap`): fixed 4096-byte pages of
//!   same-type slots, tracked by a packed-nibble bitmap.
//! - **Spill index** (`spill`): poplar-sorted array of tagged pointers to
//!   host-allocated, out-of-heap objects.
//! - **Marking** (`mark`): worklist tracing with overflow-tolerant
//!   recovery and a finalization-reachability pass.
//! - **Sweeping** (`sweep`): two-pass reclamation with finalizer
//!   resurrection and notify callbacks.
//! - **Allocation** (`alloc`): the `alloc`/`malloc`/`blob`/`strdup`/
//!   `manage` family, plus collection-trigger bookkeeping.
//! - **Anchoring** (`anchor`): an off-heap scoped stack protecting
//!   freshly allocated, not-yet-rooted objects.
//!
//! See `manager::Manager` for the public entry point.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod addr;
pub mod alloc;
pub mod anchor;
pub mod bitmap;
pub mod block;
pub mod config;
pub mod error;
pub mod heap;
pub mod manager;
pub mod mark;
pub mod roots;
pub mod spill;
pub mod sweep;
pub mod types;

pub use addr::Addr;
pub use config::GcConfig;
pub use error::{GcError, GcResult};
pub use manager::{Manager, RegistryInfo, TypeUsage};
pub use roots::RootCell;
pub use types::TypeId;
