//! Range-mapping façade: adapts the single-slot index to the file system's
//! `(offset, length)` request shape.
//!
//! Each request issues one index call per logical block, up to
//! [`MAX_GET_BLOCKS_RETURN`] blocks, and coalesces physically contiguous
//! neighbours into runs. Because a slot's physical block is fixed by its
//! hash position, adjacent logical blocks rarely land adjacent physically —
//! most runs have length 1, and the cap bounds the per-call work instead of
//! the run count.
//!
//! Allocating and truncating writes are bracketed by an undo-log
//! transaction: the allocator bitmap's pre-image is logged before each
//! bitmap flip, so a crash mid-request rolls the bitmap back on recovery.
//! Keys are validated before the transaction opens, and a recoverable
//! failure mid-transaction is rolled back in place with
//! [`UndoLog::abort_tx`](crate::undo::UndoLog::abort_tx), leaving the
//! façade usable. Only when storage itself has failed is the transaction
//! left open, for the next [`UndoLog::open`](crate::undo::UndoLog::open)
//! to roll back the same way a crash would.

use std::fmt;

use crate::alloc::{AllocError, BlockBitmap};
use crate::config::MAX_GET_BLOCKS_RETURN;
use crate::index::{HashIndex, IndexError};
use crate::key::make_key;
use crate::types::{Inum, LAddr, PAddr};
use crate::undo::{UndoLog, UndoLogError};

/// A physically contiguous run of mapped blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRun {
    pub pblk: PAddr,
    pub count: u32,
}

/// Errors surfaced by the façade; each wraps the failing layer's error.
#[derive(Debug)]
pub enum BlockMapError {
    Index(IndexError),
    Undo(UndoLogError),
    Alloc(AllocError),
}

impl fmt::Display for BlockMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockMapError::Index(e) => write!(f, "index: {}", e),
            BlockMapError::Undo(e) => write!(f, "undo log: {}", e),
            BlockMapError::Alloc(e) => write!(f, "allocator: {}", e),
        }
    }
}

impl std::error::Error for BlockMapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BlockMapError::Index(e) => Some(e),
            BlockMapError::Undo(e) => Some(e),
            BlockMapError::Alloc(e) => Some(e),
        }
    }
}

impl From<IndexError> for BlockMapError {
    fn from(e: IndexError) -> Self {
        BlockMapError::Index(e)
    }
}

impl From<UndoLogError> for BlockMapError {
    fn from(e: UndoLogError) -> Self {
        BlockMapError::Undo(e)
    }
}

impl From<AllocError> for BlockMapError {
    fn from(e: AllocError) -> Self {
        BlockMapError::Alloc(e)
    }
}

/// The façade: one index, one undo log, one allocator bitmap.
pub struct BlockMap {
    index: HashIndex,
    undo: UndoLog,
    bitmap: BlockBitmap,
}

impl BlockMap {
    pub fn new(index: HashIndex, undo: UndoLog, bitmap: BlockBitmap) -> BlockMap {
        BlockMap {
            index,
            undo,
            bitmap,
        }
    }

    /// The underlying index, for direct single-key calls.
    pub fn index(&self) -> &HashIndex {
        &self.index
    }

    /// Tear down, handing the parts back.
    pub fn into_parts(self) -> (HashIndex, UndoLog, BlockBitmap) {
        (self.index, self.undo, self.bitmap)
    }

    /// Append `pblk` to `runs`, extending the last run when contiguous.
    /// Returns false when the run budget is exhausted.
    fn push_block(runs: &mut Vec<BlockRun>, pblk: PAddr) -> bool {
        if let Some(last) = runs.last_mut() {
            if last.pblk + last.count as u64 == pblk {
                last.count += 1;
                return true;
            }
        }
        if runs.len() == MAX_GET_BLOCKS_RETURN {
            return false;
        }
        runs.push(BlockRun { pblk, count: 1 });
        true
    }

    /// Map `[start_lblk, start_lblk + len)` of file `inum` to physical runs.
    ///
    /// Stops at the first unmapped block (partial answers are normal: the
    /// caller re-issues from where the answer ended) or after
    /// [`MAX_GET_BLOCKS_RETURN`] blocks.
    pub fn get_blocks(
        &self,
        inum: Inum,
        start_lblk: LAddr,
        len: u32,
    ) -> Result<Vec<BlockRun>, BlockMapError> {
        let mut runs = Vec::new();
        for i in 0..len.min(MAX_GET_BLOCKS_RETURN as u32) {
            let key = make_key(inum, start_lblk + i)?;
            match self.index.lookup(key)? {
                None => break,
                Some(pblk) => {
                    if !Self::push_block(&mut runs, pblk) {
                        break;
                    }
                }
            }
        }
        Ok(runs)
    }

    /// Allocate mappings for `[start_lblk, start_lblk + len)`, inserting one
    /// slot per block inside a single undo transaction.
    ///
    /// A block already mapped (by an earlier call or a racing writer) is
    /// reused as-is. Returns the runs in request order.
    pub fn create_blocks(
        &mut self,
        inum: Inum,
        start_lblk: LAddr,
        len: u32,
    ) -> Result<Vec<BlockRun>, BlockMapError> {
        // Key validation happens before the transaction opens: a reserved
        // (inum, lblk) pair is a per-call input error and must not leave
        // the log's transaction flag set.
        let count = len.min(MAX_GET_BLOCKS_RETURN as u32);
        let mut keys = Vec::with_capacity(count as usize);
        for i in 0..count {
            keys.push(make_key(inum, start_lblk + i)?);
        }

        self.undo.start_tx()?;
        match self.map_keys(&keys) {
            Ok(runs) => {
                self.undo.commit_tx()?;
                Ok(runs)
            }
            Err(e) => Err(self.unwind_tx(e)),
        }
    }

    fn map_keys(&self, keys: &[u64]) -> Result<Vec<BlockRun>, BlockMapError> {
        let mut runs = Vec::new();
        for &key in keys {
            let pblk = match self.index.insert(key) {
                Ok(pblk) => {
                    let pre = self.bitmap.preimage_byte(pblk)?;
                    self.undo.log_balloc(pblk, 1, pre)?;
                    self.bitmap.reserve(pblk)?;
                    pblk
                }
                Err(IndexError::Exists) => match self.index.lookup(key)? {
                    Some(pblk) => pblk,
                    // Removed between the insert and the lookup; the caller
                    // rewinds and retries the request.
                    None => break,
                },
                Err(e) => return Err(e.into()),
            };
            if !Self::push_block(&mut runs, pblk) {
                break;
            }
        }
        Ok(runs)
    }

    /// Unmap `[start_lblk, end_lblk]` of file `inum`, releasing the backing
    /// blocks. Returns the number of blocks actually removed.
    pub fn truncate(
        &mut self,
        inum: Inum,
        start_lblk: LAddr,
        end_lblk: LAddr,
    ) -> Result<u32, BlockMapError> {
        // The reserved domain sits at the very top of the lblk space, so
        // validating the range's last key clears the whole range before
        // the transaction opens.
        make_key(inum, end_lblk)?;

        self.undo.start_tx()?;
        match self.unmap_range(inum, start_lblk, end_lblk) {
            Ok(removed) => {
                self.undo.commit_tx()?;
                Ok(removed)
            }
            Err(e) => Err(self.unwind_tx(e)),
        }
    }

    fn unmap_range(
        &self,
        inum: Inum,
        start_lblk: LAddr,
        end_lblk: LAddr,
    ) -> Result<u32, BlockMapError> {
        let mut removed = 0u32;
        for lblk in start_lblk..=end_lblk {
            let key = make_key(inum, lblk)?;
            if let Some(pblk) = self.index.remove(key)? {
                let pre = self.bitmap.preimage_byte(pblk)?;
                self.undo.log_balloc(pblk, 1, pre)?;
                self.bitmap.release(pblk)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Close out the open transaction after a failed loop body.
    ///
    /// Recoverable failures are rolled back in place so the façade stays
    /// usable; when storage itself is the problem the transaction is left
    /// open and the next attach rolls it back, exactly as a crash would.
    fn unwind_tx(&mut self, err: BlockMapError) -> BlockMapError {
        let storage_dead = matches!(
            err,
            BlockMapError::Index(IndexError::Poisoned)
                | BlockMapError::Index(IndexError::Storage(_))
                | BlockMapError::Undo(_)
        );
        if !storage_dead {
            if let Err(abort_err) = self.undo.abort_tx(&mut self.bitmap) {
                log::error!("transaction abort failed: {}", abort_err);
            }
        }
        err
    }
}

impl fmt::Debug for BlockMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockMap")
            .field("index", &self.index)
            .field("bitmap", &self.bitmap)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_block_coalesces_contiguous() {
        let mut runs = Vec::new();
        assert!(BlockMap::push_block(&mut runs, 10));
        assert!(BlockMap::push_block(&mut runs, 11));
        assert!(BlockMap::push_block(&mut runs, 13));
        assert_eq!(
            runs,
            vec![
                BlockRun { pblk: 10, count: 2 },
                BlockRun { pblk: 13, count: 1 }
            ]
        );
    }

    #[test]
    fn push_block_honours_run_budget() {
        let mut runs = Vec::new();
        for i in 0..MAX_GET_BLOCKS_RETURN {
            assert!(BlockMap::push_block(&mut runs, (i * 2) as u64));
        }
        // Ninth discontiguous block does not fit.
        assert!(!BlockMap::push_block(&mut runs, 100));
        // But extending the last run still does.
        let last = runs.last().unwrap().pblk + 1;
        assert!(BlockMap::push_block(&mut runs, last));
        assert_eq!(runs.len(), MAX_GET_BLOCKS_RETURN);
    }
}
