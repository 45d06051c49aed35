// config.rs — Compile-time constants and runtime environment hooks.
//
// The index has no CLI; everything here is either a fixed device-geometry
// constant or an environment variable consumed from the enclosing file
// system at startup.

/// Size of one file-system block in bytes.
pub const BLOCK_SIZE_BYTES: usize = 4096;

/// log2 of [`BLOCK_SIZE_BYTES`]; shift to convert byte offsets to block numbers.
pub const BLOCK_SHIFT: u32 = 12;

/// Maximum number of `(physical block, run length)` pairs a single
/// range-mapping request may return.
pub const MAX_GET_BLOCKS_RETURN: usize = 8;

/// Whether the triangular-step probe schedule is compiled in.
/// The default is linear probing (step = 1).
pub const QUADRATIC_PROBE: bool = cfg!(feature = "quadratic-probe");

/// Whether per-slot reader-writer locking is compiled in.
/// The default is the lock-free CAS path.
pub const SLOT_LOCKS: bool = cfg!(feature = "slot-locks");

/// Index structure variants selectable by the enclosing file system.
///
/// Only `GlobalHashTable` is implemented by this crate; the other variants
/// share the same external contract and are provided by sibling crates.
/// The caller dispatches on the parsed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdxStruct {
    ExtentTrees,
    LevelHashTables,
    RadixTrees,
    GlobalHashTable,
    GlobalCuckooHash,
    /// Variable absent or empty.
    Unset,
}

/// Read the index-structure selection from the `MLFS_IDX_STRUCT` environment
/// variable. Unrecognised values are reported and treated as unset.
pub fn idx_struct_from_env() -> IdxStruct {
    const ENV_IDX_STRUCT: &str = "MLFS_IDX_STRUCT";
    match std::env::var(ENV_IDX_STRUCT) {
        Ok(v) => match v.as_str() {
            "EXTENT_TREES" => IdxStruct::ExtentTrees,
            "LEVEL_HASH_TABLES" => IdxStruct::LevelHashTables,
            "RADIX_TREES" => IdxStruct::RadixTrees,
            "GLOBAL_HASH_TABLE" => IdxStruct::GlobalHashTable,
            "GLOBAL_CUCKOO_HASH" => IdxStruct::GlobalCuckooHash,
            "" => IdxStruct::Unset,
            other => {
                log::warn!("ignoring unrecognised {}={}", ENV_IDX_STRUCT, other);
                IdxStruct::Unset
            }
        },
        Err(_) => IdxStruct::Unset,
    }
}

/// Whether the in-DRAM block cache is requested (`MLFS_IDX_CACHE=1`).
///
/// The cache applies to the tree-shaped index variants; the hash index reads
/// slots in place and ignores it. Exposed so callers can pass the setting
/// through uniformly.
pub fn idx_cache_enabled() -> bool {
    matches!(std::env::var("MLFS_IDX_CACHE").as_deref(), Ok("1"))
}

/// Whether per-call timing/probe counters are requested (`MLFS_PROFILE` set
/// to anything non-empty).
pub fn profile_enabled() -> bool {
    matches!(std::env::var("MLFS_PROFILE").as_deref(), Ok(v) if !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_geometry_consistent() {
        assert_eq!(1usize << BLOCK_SHIFT, BLOCK_SIZE_BYTES);
    }

    #[test]
    fn idx_struct_parses_known_values() {
        std::env::set_var("MLFS_IDX_STRUCT", "GLOBAL_HASH_TABLE");
        assert_eq!(idx_struct_from_env(), IdxStruct::GlobalHashTable);
        std::env::set_var("MLFS_IDX_STRUCT", "EXTENT_TREES");
        assert_eq!(idx_struct_from_env(), IdxStruct::ExtentTrees);
        std::env::set_var("MLFS_IDX_STRUCT", "bogus");
        assert_eq!(idx_struct_from_env(), IdxStruct::Unset);
        std::env::remove_var("MLFS_IDX_STRUCT");
        assert_eq!(idx_struct_from_env(), IdxStruct::Unset);
    }

    #[test]
    fn profile_defaults_off() {
        std::env::remove_var("MLFS_PROFILE");
        assert!(!profile_enabled());
        std::env::set_var("MLFS_PROFILE", "1");
        assert!(profile_enabled());
        std::env::remove_var("MLFS_PROFILE");
    }
}
