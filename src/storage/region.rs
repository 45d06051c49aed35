//! One persistent byte window, mapped from a block device or backing file.
//!
//! A [`Region`] is obtained once at startup and owned by exactly one index
//! (or undo log) for its lifetime. All durable state lives inside it; callers
//! address it by byte offset or by `(block, offset)` pairs.
//!
//! Durability comes in two flavours, recorded per region:
//! - true persistent memory: cacheline flushes followed by a store fence;
//! - anything else: `msync` of the containing page range.
//!
//! Ordering **across** `persist` calls is the caller's responsibility; a
//! single call only guarantees the named byte range is durable when it
//! returns.

use std::fmt;
use std::fs::OpenOptions;
use std::num::NonZeroUsize;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8};

use nix::sys::mman::{mmap, mmap_anonymous, msync, munmap, MapFlags, MsFlags, ProtFlags};

use crate::config::BLOCK_SIZE_BYTES;

const PAGE: usize = 4096;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by the storage port.
#[derive(Debug)]
pub enum StorageError {
    /// Backing-file open or size error.
    Io(std::io::Error),
    /// mmap / msync / munmap failure.
    Sys(nix::Error),
    /// A byte range falls outside the mapped window.
    OutOfBounds { offset: usize, len: usize },
    /// An atomic accessor was asked for an unaligned offset.
    Misaligned { offset: usize, align: usize },
    /// The requested mapping length was zero.
    EmptyRegion,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "backing file: {}", e),
            StorageError::Sys(e) => write!(f, "mmap/msync: {}", e),
            StorageError::OutOfBounds { offset, len } => {
                write!(f, "range [{}, +{}) outside mapped region", offset, len)
            }
            StorageError::Misaligned { offset, align } => {
                write!(f, "offset {} not aligned to {}", offset, align)
            }
            StorageError::EmptyRegion => f.write_str("zero-length region"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            StorageError::Sys(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

impl From<nix::Error> for StorageError {
    fn from(e: nix::Error) -> Self {
        StorageError::Sys(e)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Region
// ─────────────────────────────────────────────────────────────────────────────

/// A mapped persistent byte window.
///
/// The region is exclusively owned by this process while running. Interior
/// mutability is deliberate: concurrent mutation is coordinated above this
/// layer (per-slot CAS in the index, single-writer tail in the undo log), so
/// every accessor takes `&self`.
pub struct Region {
    base: NonNull<libc::c_void>,
    len: usize,
    is_pmem: bool,
}

// The raw pointer is the mapping base; the mapping lives as long as the
// Region and all concurrent access goes through atomics or disjoint ranges.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Map `nbytes` of `path`, creating and sizing the file if needed.
    ///
    /// Device paths (`/dev/...`) are mapped as-is without resizing. Whether
    /// the region is true persistent memory is inferred from the path
    /// (devdax character devices); use [`Region::open_with_mode`] to force it.
    pub fn open(path: &Path, nbytes: usize) -> Result<Region, StorageError> {
        // Byte-wise prefix match: "/dev/dax0.0" is devdax, and
        // Path::starts_with would reject it component-wise.
        let is_devdax = path.to_string_lossy().starts_with("/dev/dax");
        Self::open_with_mode(path, nbytes, is_devdax)
    }

    /// Map `nbytes` of `path` with an explicit durability mode.
    pub fn open_with_mode(
        path: &Path,
        nbytes: usize,
        is_pmem: bool,
    ) -> Result<Region, StorageError> {
        let len = NonZeroUsize::new(nbytes).ok_or(StorageError::EmptyRegion)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(!path.starts_with("/dev"))
            .open(path)?;
        if !path.starts_with("/dev") && file.metadata()?.len() < nbytes as u64 {
            file.set_len(nbytes as u64)?;
        }
        let base = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )?
        };
        Ok(Region {
            base,
            len: nbytes,
            is_pmem,
        })
    }

    /// Anonymous mapping, for tests and volatile scratch use. Persist takes
    /// the cacheline path (there is no file to msync).
    pub fn anonymous(nbytes: usize) -> Result<Region, StorageError> {
        let len = NonZeroUsize::new(nbytes).ok_or(StorageError::EmptyRegion)?;
        let base = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )?
        };
        Ok(Region {
            base,
            len: nbytes,
            is_pmem: true,
        })
    }

    /// Length of the window in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of whole file-system blocks in the window.
    #[inline]
    pub fn nblocks(&self) -> u64 {
        (self.len / BLOCK_SIZE_BYTES) as u64
    }

    /// Whether persist uses cacheline flush + fence (true PM) or msync.
    #[inline]
    pub fn is_pmem(&self) -> bool {
        self.is_pmem
    }

    /// Base address of the mapping.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr() as *mut u8
    }

    #[inline]
    fn check_range(&self, offset: usize, len: usize) -> Result<(), StorageError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(StorageError::OutOfBounds { offset, len }),
        }
    }

    /// Copy `dst.len()` bytes out of the window at `offset`.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<(), StorageError> {
        self.check_range(offset, dst.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.base().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Copy `src` into the window at `offset`. Not durable until persisted.
    pub fn write(&self, offset: usize, src: &[u8]) -> Result<(), StorageError> {
        self.check_range(offset, src.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.base().add(offset), src.len());
        }
        Ok(())
    }

    /// Fill `[offset, offset+len)` with `byte`. Not durable until persisted.
    pub fn fill(&self, offset: usize, len: usize, byte: u8) -> Result<(), StorageError> {
        self.check_range(offset, len)?;
        unsafe {
            std::ptr::write_bytes(self.base().add(offset), byte, len);
        }
        Ok(())
    }

    /// Block-level read fallback: `len` bytes from `(block, off)` into `dst`.
    pub fn read_block(
        &self,
        block: u64,
        off: usize,
        dst: &mut [u8],
    ) -> Result<(), StorageError> {
        self.read(block as usize * BLOCK_SIZE_BYTES + off, dst)
    }

    /// Block-level write fallback: copies and persists in one call.
    pub fn write_block(&self, block: u64, off: usize, src: &[u8]) -> Result<(), StorageError> {
        let offset = block as usize * BLOCK_SIZE_BYTES + off;
        self.write(offset, src)?;
        self.persist(offset, src.len())
    }

    // ── Atomic cell views ───────────────────────────────────────────────────
    // The persistent layout stores multi-byte fields 8- or 4-byte aligned, so
    // these views are always available where the layout says they are.

    /// View 8 aligned bytes at `offset` as an atomic cell.
    pub fn atomic_u64(&self, offset: usize) -> Result<&AtomicU64, StorageError> {
        self.check_range(offset, 8)?;
        if offset % 8 != 0 {
            return Err(StorageError::Misaligned { offset, align: 8 });
        }
        Ok(unsafe { &*(self.base().add(offset) as *const AtomicU64) })
    }

    /// View 4 aligned bytes at `offset` as an atomic cell.
    pub fn atomic_u32(&self, offset: usize) -> Result<&AtomicU32, StorageError> {
        self.check_range(offset, 4)?;
        if offset % 4 != 0 {
            return Err(StorageError::Misaligned { offset, align: 4 });
        }
        Ok(unsafe { &*(self.base().add(offset) as *const AtomicU32) })
    }

    /// View one byte at `offset` as an atomic cell.
    pub fn atomic_u8(&self, offset: usize) -> Result<&AtomicU8, StorageError> {
        self.check_range(offset, 1)?;
        Ok(unsafe { &*(self.base().add(offset) as *const AtomicU8) })
    }

    // ── Durability ──────────────────────────────────────────────────────────

    /// Make `[offset, offset+len)` durable.
    ///
    /// On true persistent memory this flushes the covering cachelines and
    /// fences; otherwise it msyncs the covering page range synchronously.
    pub fn persist(&self, offset: usize, len: usize) -> Result<(), StorageError> {
        self.check_range(offset, len)?;
        if len == 0 {
            return Ok(());
        }
        if self.is_pmem {
            cacheline_flush(unsafe { self.base().add(offset) }, len);
            return Ok(());
        }
        // msync requires a page-aligned address; widen to page boundaries.
        let start = offset & !(PAGE - 1);
        let end = (offset + len + PAGE - 1) & !(PAGE - 1);
        let end = end.min(self.len);
        let ptr = unsafe { self.base().add(start) } as *mut libc::c_void;
        unsafe {
            // Mapping base is page-aligned, so ptr is too.
            msync(
                NonNull::new_unchecked(ptr),
                end - start,
                MsFlags::MS_SYNC,
            )?;
        }
        Ok(())
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // Unmap failures at teardown are unreportable; the region is gone
        // either way.
        let _ = unsafe { munmap(self.base, self.len) };
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("len", &self.len)
            .field("is_pmem", &self.is_pmem)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Flush primitives
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(target_arch = "x86_64")]
fn cacheline_flush(ptr: *const u8, len: usize) {
    use core::arch::x86_64::{_mm_clflush, _mm_sfence};
    const CACHELINE: usize = 64;
    let start = (ptr as usize) & !(CACHELINE - 1);
    let end = ptr as usize + len;
    let mut line = start;
    while line < end {
        unsafe { _mm_clflush(line as *const u8) };
        line += CACHELINE;
    }
    unsafe { _mm_sfence() };
}

#[cfg(not(target_arch = "x86_64"))]
fn cacheline_flush(_ptr: *const u8, _len: usize) {
    // No portable cacheline flush; a full fence keeps store ordering.
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn anonymous_round_trip() {
        let r = Region::anonymous(2 * BLOCK_SIZE_BYTES).unwrap();
        assert_eq!(r.nblocks(), 2);
        r.write(100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        r.read(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        r.persist(100, 5).unwrap();
    }

    #[test]
    fn file_backed_round_trip_and_msync() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let r = Region::open(tmp.path(), BLOCK_SIZE_BYTES).unwrap();
        assert!(!r.is_pmem());
        r.write_block(0, 12, &[0xAB; 16]).unwrap();
        let mut buf = [0u8; 16];
        r.read_block(0, 12, &mut buf).unwrap();
        assert_eq!(buf, [0xAB; 16]);
    }

    #[test]
    fn reopen_sees_persisted_bytes() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        {
            let r = Region::open(tmp.path(), BLOCK_SIZE_BYTES).unwrap();
            r.write(0, b"durable").unwrap();
            r.persist(0, 7).unwrap();
        }
        let r = Region::open(tmp.path(), BLOCK_SIZE_BYTES).unwrap();
        let mut buf = [0u8; 7];
        r.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"durable");
    }

    #[test]
    fn bounds_are_enforced() {
        let r = Region::anonymous(BLOCK_SIZE_BYTES).unwrap();
        assert!(matches!(
            r.read(BLOCK_SIZE_BYTES - 2, &mut [0u8; 4]),
            Err(StorageError::OutOfBounds { .. })
        ));
        assert!(matches!(
            r.write(usize::MAX, b"x"),
            Err(StorageError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn atomic_views_require_alignment() {
        let r = Region::anonymous(BLOCK_SIZE_BYTES).unwrap();
        assert!(r.atomic_u64(8).is_ok());
        assert!(matches!(
            r.atomic_u64(12),
            Err(StorageError::Misaligned { .. })
        ));
        let cell = r.atomic_u64(16).unwrap();
        cell.store(0x1122_3344_5566_7788, Ordering::Relaxed);
        let mut buf = [0u8; 8];
        r.read(16, &mut buf).unwrap();
        assert_eq!(u64::from_ne_bytes(buf), 0x1122_3344_5566_7788);
    }

    #[test]
    fn zero_length_region_is_rejected() {
        assert!(matches!(
            Region::anonymous(0),
            Err(StorageError::EmptyRegion)
        ));
    }
}
