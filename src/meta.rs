//! Persistent meta block: the first block of the index region.
//!
//! Field offsets are part of the on-media format and must not move:
//!
//! | offset | width | field         |
//! |--------|-------|---------------|
//! | 0      | 4     | `is_pmem`     |
//! | 4      | 4     | `valid`       |
//! | 8      | 4     | `meta_size`   |
//! | 12     | 4     | `size`        |
//! | 16     | 4     | `mod`         |
//! | 20     | 4     | `mask`        |
//! | 24     | 4     | `nnodes`      |
//! | 28     | 4     | `noccupied`   |
//! | 32     | 8     | `entries_blk` |
//! | 40     | 8     | `num_entries` |
//! | 48     | ...   | reserved, zero|
//!
//! All fields are little-endian. `valid` transitions `0 → 1` exactly once per
//! initialized region, strictly after every entry slot has been formatted and
//! every other meta field flushed.

use std::sync::atomic::Ordering;

use crate::config::BLOCK_SIZE_BYTES;
use crate::storage::{Region, StorageError};

pub const OFF_IS_PMEM: usize = 0;
pub const OFF_VALID: usize = 4;
pub const OFF_META_SIZE: usize = 8;
pub const OFF_SIZE: usize = 12;
pub const OFF_MOD: usize = 16;
pub const OFF_MASK: usize = 20;
pub const OFF_NNODES: usize = 24;
pub const OFF_NOCCUPIED: usize = 28;
pub const OFF_ENTRIES_BLK: usize = 32;
pub const OFF_NUM_ENTRIES: usize = 40;
pub const RESERVED_START: usize = 48;

/// Magic written to `valid` once formatting is complete. Anything else means
/// "uninitialized, rebuild".
pub const VALID_MAGIC: u32 = 1;

/// Accessor over the meta block at a fixed byte base inside a region.
///
/// Holds no data itself; every call reads or writes the mapped bytes so the
/// view can never go stale.
#[derive(Debug, Clone, Copy)]
pub struct Meta {
    base: usize,
}

impl Meta {
    /// Place a view at `base_block`, verifying the block fits the region.
    pub fn at_block(region: &Region, base_block: u64) -> Result<Meta, StorageError> {
        let base = base_block as usize * BLOCK_SIZE_BYTES;
        if base + BLOCK_SIZE_BYTES > region.len() {
            return Err(StorageError::OutOfBounds {
                offset: base,
                len: BLOCK_SIZE_BYTES,
            });
        }
        Ok(Meta { base })
    }

    /// Byte offset of the meta block inside its region.
    #[inline]
    pub fn byte_base(&self) -> usize {
        self.base
    }

    // ── u32 fields ──────────────────────────────────────────────────────────

    fn load_u32(&self, r: &Region, off: usize) -> Result<u32, StorageError> {
        Ok(u32::from_le(r.atomic_u32(self.base + off)?.load(Ordering::Acquire)))
    }

    fn store_u32(&self, r: &Region, off: usize, v: u32) -> Result<(), StorageError> {
        r.atomic_u32(self.base + off)?
            .store(v.to_le(), Ordering::Release);
        Ok(())
    }

    fn load_u64(&self, r: &Region, off: usize) -> Result<u64, StorageError> {
        Ok(u64::from_le(r.atomic_u64(self.base + off)?.load(Ordering::Acquire)))
    }

    fn store_u64(&self, r: &Region, off: usize, v: u64) -> Result<(), StorageError> {
        r.atomic_u64(self.base + off)?
            .store(v.to_le(), Ordering::Release);
        Ok(())
    }

    pub fn is_pmem(&self, r: &Region) -> Result<bool, StorageError> {
        Ok(self.load_u32(r, OFF_IS_PMEM)? != 0)
    }

    pub fn set_is_pmem(&self, r: &Region, v: bool) -> Result<(), StorageError> {
        self.store_u32(r, OFF_IS_PMEM, v as u32)
    }

    pub fn valid(&self, r: &Region) -> Result<u32, StorageError> {
        self.load_u32(r, OFF_VALID)
    }

    pub fn set_valid(&self, r: &Region, v: u32) -> Result<(), StorageError> {
        self.store_u32(r, OFF_VALID, v)
    }

    pub fn meta_size(&self, r: &Region) -> Result<u32, StorageError> {
        self.load_u32(r, OFF_META_SIZE)
    }

    pub fn set_meta_size(&self, r: &Region, v: u32) -> Result<(), StorageError> {
        self.store_u32(r, OFF_META_SIZE, v)
    }

    pub fn size(&self, r: &Region) -> Result<u32, StorageError> {
        self.load_u32(r, OFF_SIZE)
    }

    pub fn set_size(&self, r: &Region, v: u32) -> Result<(), StorageError> {
        self.store_u32(r, OFF_SIZE, v)
    }

    pub fn modulus(&self, r: &Region) -> Result<u32, StorageError> {
        self.load_u32(r, OFF_MOD)
    }

    pub fn set_modulus(&self, r: &Region, v: u32) -> Result<(), StorageError> {
        self.store_u32(r, OFF_MOD, v)
    }

    pub fn mask(&self, r: &Region) -> Result<u32, StorageError> {
        self.load_u32(r, OFF_MASK)
    }

    pub fn set_mask(&self, r: &Region, v: u32) -> Result<(), StorageError> {
        self.store_u32(r, OFF_MASK, v)
    }

    pub fn nnodes(&self, r: &Region) -> Result<u32, StorageError> {
        self.load_u32(r, OFF_NNODES)
    }

    pub fn set_nnodes(&self, r: &Region, v: u32) -> Result<(), StorageError> {
        self.store_u32(r, OFF_NNODES, v)
    }

    pub fn noccupied(&self, r: &Region) -> Result<u32, StorageError> {
        self.load_u32(r, OFF_NOCCUPIED)
    }

    pub fn set_noccupied(&self, r: &Region, v: u32) -> Result<(), StorageError> {
        self.store_u32(r, OFF_NOCCUPIED, v)
    }

    /// Racy relaxed counter bump; advisory statistics only.
    pub fn counter_add(&self, r: &Region, off: usize, delta: i32) -> Result<u32, StorageError> {
        let cell = r.atomic_u32(self.base + off)?;
        let mut cur = cell.load(Ordering::Relaxed);
        loop {
            let next = u32::from_le(cur).wrapping_add_signed(delta).to_le();
            match cell.compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return Ok(u32::from_le(next)),
                Err(seen) => cur = seen,
            }
        }
    }

    pub fn entries_blk(&self, r: &Region) -> Result<u64, StorageError> {
        self.load_u64(r, OFF_ENTRIES_BLK)
    }

    pub fn set_entries_blk(&self, r: &Region, v: u64) -> Result<(), StorageError> {
        self.store_u64(r, OFF_ENTRIES_BLK, v)
    }

    pub fn num_entries(&self, r: &Region) -> Result<u64, StorageError> {
        self.load_u64(r, OFF_NUM_ENTRIES)
    }

    pub fn set_num_entries(&self, r: &Region, v: u64) -> Result<(), StorageError> {
        self.store_u64(r, OFF_NUM_ENTRIES, v)
    }

    /// Zero the reserved tail of the meta block.
    pub fn clear_reserved(&self, r: &Region) -> Result<(), StorageError> {
        r.fill(
            self.base + RESERVED_START,
            BLOCK_SIZE_BYTES - RESERVED_START,
            0,
        )
    }

    /// Persist one field.
    pub fn persist_field(&self, r: &Region, off: usize, width: usize) -> Result<(), StorageError> {
        r.persist(self.base + off, width)
    }

    /// Persist the whole meta block.
    pub fn persist_all(&self, r: &Region) -> Result<(), StorageError> {
        r.persist(self.base, BLOCK_SIZE_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_offsets_are_fixed() {
        assert_eq!(OFF_IS_PMEM, 0);
        assert_eq!(OFF_VALID, 4);
        assert_eq!(OFF_META_SIZE, 8);
        assert_eq!(OFF_SIZE, 12);
        assert_eq!(OFF_MOD, 16);
        assert_eq!(OFF_MASK, 20);
        assert_eq!(OFF_NNODES, 24);
        assert_eq!(OFF_NOCCUPIED, 28);
        assert_eq!(OFF_ENTRIES_BLK, 32);
        assert_eq!(OFF_NUM_ENTRIES, 40);
        assert_eq!(RESERVED_START, 48);
    }

    #[test]
    fn fields_round_trip_little_endian() {
        let r = Region::anonymous(2 * BLOCK_SIZE_BYTES).unwrap();
        let m = Meta::at_block(&r, 0).unwrap();
        m.set_valid(&r, VALID_MAGIC).unwrap();
        m.set_modulus(&r, 127).unwrap();
        m.set_entries_blk(&r, 0x1_0000_0001).unwrap();
        m.set_num_entries(&r, 4096).unwrap();

        assert_eq!(m.valid(&r).unwrap(), VALID_MAGIC);
        assert_eq!(m.modulus(&r).unwrap(), 127);
        assert_eq!(m.entries_blk(&r).unwrap(), 0x1_0000_0001);
        assert_eq!(m.num_entries(&r).unwrap(), 4096);

        // The media bytes themselves are little-endian.
        let mut raw = [0u8; 4];
        r.read(OFF_MOD, &mut raw).unwrap();
        assert_eq!(u32::from_le_bytes(raw), 127);
    }

    #[test]
    fn counter_add_wraps_signed() {
        let r = Region::anonymous(BLOCK_SIZE_BYTES).unwrap();
        let m = Meta::at_block(&r, 0).unwrap();
        m.set_nnodes(&r, 0).unwrap();
        assert_eq!(m.counter_add(&r, OFF_NNODES, 1).unwrap(), 1);
        assert_eq!(m.counter_add(&r, OFF_NNODES, 1).unwrap(), 2);
        assert_eq!(m.counter_add(&r, OFF_NNODES, -2).unwrap(), 0);
    }

    #[test]
    fn meta_must_fit_region() {
        let r = Region::anonymous(BLOCK_SIZE_BYTES).unwrap();
        assert!(Meta::at_block(&r, 0).is_ok());
        assert!(Meta::at_block(&r, 1).is_err());
    }
}
