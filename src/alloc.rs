//! Block-allocation bitmap with byte-granular pre-images.
//!
//! One bit per physical block, packed LSB-first from byte 0 of the bitmap's
//! own persistent region. Mutators hand back nothing; callers that need
//! crash atomicity read the covering byte with [`BlockBitmap::preimage_byte`]
//! first and record it in the undo log, which restores it through the
//! [`UndoTarget`](crate::undo::UndoTarget) implementation here.

use std::fmt;

use crate::storage::{Region, StorageError};
use crate::types::PAddr;
use crate::undo::UndoTarget;

/// Errors raised by the allocator bitmap.
#[derive(Debug)]
pub enum AllocError {
    /// Block number beyond the bitmap's capacity.
    OutOfRange { block: PAddr },
    /// Reserve of a block already marked allocated.
    DoubleAlloc { block: PAddr },
    /// Release of a block already marked free.
    DoubleFree { block: PAddr },
    Storage(StorageError),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfRange { block } => write!(f, "block {} out of range", block),
            AllocError::DoubleAlloc { block } => write!(f, "block {} already allocated", block),
            AllocError::DoubleFree { block } => write!(f, "block {} already free", block),
            AllocError::Storage(e) => write!(f, "storage: {}", e),
        }
    }
}

impl std::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AllocError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for AllocError {
    fn from(e: StorageError) -> Self {
        AllocError::Storage(e)
    }
}

/// Bit-per-block allocation map over a persistent region.
pub struct BlockBitmap {
    region: Region,
    nblocks: u64,
}

impl BlockBitmap {
    /// Wrap `region` as a bitmap covering `nblocks` blocks.
    pub fn new(region: Region, nblocks: u64) -> Result<BlockBitmap, AllocError> {
        let need = (nblocks as usize + 7) / 8;
        if need > region.len() {
            return Err(AllocError::Storage(StorageError::OutOfBounds {
                offset: 0,
                len: need,
            }));
        }
        Ok(BlockBitmap { region, nblocks })
    }

    /// Number of blocks tracked.
    #[inline]
    pub fn nblocks(&self) -> u64 {
        self.nblocks
    }

    /// Release the handle, returning the region.
    pub fn close(self) -> Region {
        self.region
    }

    #[inline]
    fn check(&self, block: PAddr) -> Result<(), AllocError> {
        if block >= self.nblocks {
            return Err(AllocError::OutOfRange { block });
        }
        Ok(())
    }

    #[inline]
    fn byte_of(block: PAddr) -> usize {
        (block / 8) as usize
    }

    #[inline]
    fn bit_of(block: PAddr) -> u8 {
        1u8 << (block % 8)
    }

    fn load_byte(&self, block: PAddr) -> Result<u8, AllocError> {
        let mut b = [0u8; 1];
        self.region.read(Self::byte_of(block), &mut b)?;
        Ok(b[0])
    }

    fn store_byte(&self, block: PAddr, v: u8) -> Result<(), AllocError> {
        let off = Self::byte_of(block);
        self.region.write(off, &[v])?;
        self.region.persist(off, 1)?;
        Ok(())
    }

    /// The byte covering `block`, as it currently stands; this is the
    /// pre-image an undo entry records before a reserve/release.
    pub fn preimage_byte(&self, block: PAddr) -> Result<u8, AllocError> {
        self.check(block)?;
        self.load_byte(block)
    }

    /// Whether `block` is marked allocated.
    pub fn is_set(&self, block: PAddr) -> Result<bool, AllocError> {
        self.check(block)?;
        Ok(self.load_byte(block)? & Self::bit_of(block) != 0)
    }

    /// Mark `block` allocated.
    pub fn reserve(&self, block: PAddr) -> Result<(), AllocError> {
        self.check(block)?;
        let byte = self.load_byte(block)?;
        let bit = Self::bit_of(block);
        if byte & bit != 0 {
            return Err(AllocError::DoubleAlloc { block });
        }
        self.store_byte(block, byte | bit)
    }

    /// Mark `block` free.
    pub fn release(&self, block: PAddr) -> Result<(), AllocError> {
        self.check(block)?;
        let byte = self.load_byte(block)?;
        let bit = Self::bit_of(block);
        if byte & bit == 0 {
            return Err(AllocError::DoubleFree { block });
        }
        self.store_byte(block, byte & !bit)
    }
}

impl UndoTarget for BlockBitmap {
    /// Put the covering byte back exactly as the pre-image recorded it.
    fn restore_balloc(
        &mut self,
        start_block: u64,
        _nblk: u32,
        orig_val: u8,
    ) -> Result<(), StorageError> {
        let off = Self::byte_of(start_block);
        self.region.write(off, &[orig_val])?;
        self.region.persist(off, 1)
    }

    /// Index pre-images belong to the index region, not the bitmap.
    fn restore_index_bytes(&mut self, _: u64, _: &[u8]) -> Result<(), StorageError> {
        Ok(())
    }
}

impl fmt::Debug for BlockBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockBitmap")
            .field("nblocks", &self.nblocks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap(nblocks: u64) -> BlockBitmap {
        let region = Region::anonymous(4096).unwrap();
        BlockBitmap::new(region, nblocks).unwrap()
    }

    #[test]
    fn reserve_and_release_round_trip() {
        let bm = bitmap(64);
        assert!(!bm.is_set(10).unwrap());
        bm.reserve(10).unwrap();
        assert!(bm.is_set(10).unwrap());
        bm.release(10).unwrap();
        assert!(!bm.is_set(10).unwrap());
    }

    #[test]
    fn double_operations_are_rejected() {
        let bm = bitmap(64);
        bm.reserve(3).unwrap();
        assert!(matches!(
            bm.reserve(3),
            Err(AllocError::DoubleAlloc { block: 3 })
        ));
        bm.release(3).unwrap();
        assert!(matches!(
            bm.release(3),
            Err(AllocError::DoubleFree { block: 3 })
        ));
    }

    #[test]
    fn out_of_range_is_rejected() {
        let bm = bitmap(16);
        assert!(matches!(
            bm.reserve(16),
            Err(AllocError::OutOfRange { block: 16 })
        ));
    }

    #[test]
    fn preimage_captures_neighbours() {
        let bm = bitmap(64);
        bm.reserve(8).unwrap();
        bm.reserve(9).unwrap();
        // Blocks 8..16 share byte 1.
        assert_eq!(bm.preimage_byte(10).unwrap(), 0b0000_0011);
    }

    #[test]
    fn restore_balloc_rewinds_the_byte() {
        let mut bm = bitmap(64);
        let pre = bm.preimage_byte(8).unwrap();
        bm.reserve(8).unwrap();
        bm.reserve(12).unwrap();
        bm.restore_balloc(8, 1, pre).unwrap();
        assert!(!bm.is_set(8).unwrap());
        assert!(!bm.is_set(12).unwrap()); // same byte, rewound with it
    }
}
