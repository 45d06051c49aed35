//! Storage port: a flat byte-addressable window over one persistent device
//! region, plus the persist primitives that make writes durable.
//!
//! Submodules:
//! - [`region`] — mmap-backed [`Region`], cacheline-flush vs msync persist,
//!   block-level read/write fallback.

pub mod region;

pub use region::{Region, StorageError};
