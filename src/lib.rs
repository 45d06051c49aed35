// HashFS — persistent hash index for NVM block mapping.
//
// The crate answers one question: given a file identifier and a logical
// block offset, which physical block on persistent memory holds its data?
// The answer is positional — a key's slot in the open-addressing table *is*
// its physical block — which makes lookup a probe, insert a CAS, and the
// whole structure crash-safe with a single undo log for the multi-step
// paths around it.

pub mod alloc;
pub mod blockmap;
pub mod config;
pub mod hash;
pub mod index;
pub mod key;
pub mod meta;
pub mod storage;
pub mod types;
pub mod undo;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level convenience re-exports for the most common API entry points.
// ─────────────────────────────────────────────────────────────────────────────

/// The persistent hash index handle: attach/format, lookup, insert, remove.
pub use index::HashIndex;
/// Errors returned by index operations.
pub use index::IndexError;

/// Hash-function selection fixed at index construction.
pub use hash::HashChoice;

/// One persistent byte window with flush+fence / msync durability.
pub use storage::Region;
/// Storage-port failures.
pub use storage::StorageError;

/// Composite key construction; rejects the reserved sentinel domain.
pub use key::make_key;
/// API-boundary view of one slot: Empty, Tombstone, or a live key.
pub use key::SlotState;

/// Superblock view handed in by the enclosing file system.
pub use types::Superblock;
pub use types::{Inum, LAddr, PAddr};

/// Circular pre-image log making multi-step mutations crash-atomic.
pub use undo::{NoopTarget, UndoLog, UndoLogError, UndoTarget};

/// Range-mapping façade over the single-slot index.
pub use blockmap::{BlockMap, BlockMapError, BlockRun};

/// Block-allocation bitmap with undo pre-images.
pub use alloc::{AllocError, BlockBitmap};

/// Per-request block cap of the range-mapping façade.
pub use config::MAX_GET_BLOCKS_RETURN;
