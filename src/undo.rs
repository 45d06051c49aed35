//! Undo log: a circular log of pre-image records on its own persistent
//! region, bracketing multi-step index mutations so a crash mid-transaction
//! can be rolled back.
//!
//! Entries advance in 64-byte units from byte 0 and wrap at the region end
//! (a Skip entry pads out the tail remainder). Each entry is written in two
//! phases: payload first, persisted, then the type byte as a single atomic
//! store, persisted. Before an entry's type byte is set, the type byte of
//! the *following* unit is zeroed, so a scan from the base always terminates
//! at the true tail — it sees either `Uninitialized` or a fully formed entry,
//! never a torn one.
//!
//! Recovery on open: scan to the tail counting Start/Commit pairs. Equal
//! counts mean a clean log; one unmatched Start means a crash mid-transaction
//! and every entry after it is applied in reverse through [`UndoTarget`],
//! then a synthetic Commit is appended. Any other count combination is a bug
//! and surfaces as [`UndoLogError::Inconsistent`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::storage::{Region, StorageError};

/// Entry granularity; every entry occupies a multiple of this.
pub const ENTRY_UNIT: usize = 64;

const OFF_TYPE: usize = 0;
const OFF_SKIP_BYTES: usize = 8;
const OFF_BALLOC_START: usize = 8;
const OFF_BALLOC_NBLK: usize = 16;
const OFF_BALLOC_ORIG: usize = 20;
const OFF_IDX_DEV_OFF: usize = 8;
const OFF_IDX_NBYTES: usize = 16;
const OFF_IDX_DATA: usize = 24;

// ─────────────────────────────────────────────────────────────────────────────
// Entry model
// ─────────────────────────────────────────────────────────────────────────────

/// On-media entry type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    /// Tail sentinel; a zero-filled region reads as an empty log.
    Uninitialized = 0,
    Start = 1,
    Commit = 2,
    Skip = 3,
    Balloc = 4,
    Idx = 5,
}

impl EntryType {
    fn from_byte(b: u8) -> Option<EntryType> {
        match b {
            0 => Some(EntryType::Uninitialized),
            1 => Some(EntryType::Start),
            2 => Some(EntryType::Commit),
            3 => Some(EntryType::Skip),
            4 => Some(EntryType::Balloc),
            5 => Some(EntryType::Idx),
            _ => None,
        }
    }
}

/// A decoded log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoEntry {
    Start,
    Commit,
    Skip {
        skip_bytes: u64,
    },
    /// Pre-image of a block-allocation-bitmap byte.
    Balloc {
        start_block: u64,
        nblk: u32,
        orig_val: u8,
    },
    /// Pre-image of a persistent index byte range. Unused by the hash
    /// index's in-place CAS protocol; carried for the tree-shaped indexes
    /// that share this log.
    Idx {
        dev_byte_offset: u64,
        original: Vec<u8>,
    },
}

impl UndoEntry {
    /// Bytes the entry occupies on media, rounded up to the unit.
    fn media_len(&self) -> usize {
        let payload = match self {
            UndoEntry::Start | UndoEntry::Commit => ENTRY_UNIT,
            UndoEntry::Skip { skip_bytes } => *skip_bytes as usize,
            UndoEntry::Balloc { .. } => ENTRY_UNIT,
            UndoEntry::Idx { original, .. } => OFF_IDX_DATA + original.len(),
        };
        round_unit(payload)
    }
}

#[inline]
fn round_unit(n: usize) -> usize {
    (n + ENTRY_UNIT - 1) & !(ENTRY_UNIT - 1)
}

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by the undo log.
#[derive(Debug)]
pub enum UndoLogError {
    /// Start/Commit counts violate the at-most-one-open-transaction
    /// invariant; the log is damaged beyond automatic repair.
    Inconsistent { nstart: u32, ncommit: u32 },
    /// `start_tx` while a transaction is already open.
    TxAlreadyActive,
    /// `commit_tx` with no open transaction.
    TxNotActive,
    /// An undefined type byte was found during a scan.
    Corrupt { offset: usize, type_byte: u8 },
    /// A single entry larger than the whole log region.
    EntryTooLarge { nbytes: usize },
    Storage(StorageError),
}

impl fmt::Display for UndoLogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UndoLogError::Inconsistent { nstart, ncommit } => write!(
                f,
                "inconsistent undo log: {} starts, {} commits",
                nstart, ncommit
            ),
            UndoLogError::TxAlreadyActive => f.write_str("transaction already in progress"),
            UndoLogError::TxNotActive => f.write_str("no transaction in progress"),
            UndoLogError::Corrupt { offset, type_byte } => {
                write!(f, "undefined entry type {} at offset {}", type_byte, offset)
            }
            UndoLogError::EntryTooLarge { nbytes } => {
                write!(f, "entry of {} bytes exceeds the log region", nbytes)
            }
            UndoLogError::Storage(e) => write!(f, "storage: {}", e),
        }
    }
}

impl std::error::Error for UndoLogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UndoLogError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for UndoLogError {
    fn from(e: StorageError) -> Self {
        UndoLogError::Storage(e)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Recovery seam
// ─────────────────────────────────────────────────────────────────────────────

/// Applies pre-images during recovery. The enclosing file system provides
/// the implementation; the log itself has no knowledge of bitmap or index
/// layout.
pub trait UndoTarget {
    fn restore_balloc(
        &mut self,
        start_block: u64,
        nblk: u32,
        orig_val: u8,
    ) -> Result<(), StorageError>;

    fn restore_index_bytes(
        &mut self,
        dev_byte_offset: u64,
        original: &[u8],
    ) -> Result<(), StorageError>;
}

/// Target that discards pre-images; for logs known to hold none.
pub struct NoopTarget;

impl UndoTarget for NoopTarget {
    fn restore_balloc(&mut self, _: u64, _: u32, _: u8) -> Result<(), StorageError> {
        Ok(())
    }

    fn restore_index_bytes(&mut self, _: u64, _: &[u8]) -> Result<(), StorageError> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// UndoLog
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to the undo-log region. One transaction may be open at a time,
/// enforced by a CAS-guarded flag; the tail advances by CAS per entry.
pub struct UndoLog {
    region: Region,
    tail: AtomicUsize,
    tx_active: AtomicBool,
}

impl UndoLog {
    /// Attach to a log region, running crash recovery if the scan finds an
    /// unmatched Start.
    pub fn open(region: Region, target: &mut dyn UndoTarget) -> Result<UndoLog, UndoLogError> {
        let scan = scan_region(&region)?;

        if scan.ncommit > scan.nstart || scan.nstart - scan.ncommit > 1 {
            return Err(UndoLogError::Inconsistent {
                nstart: scan.nstart,
                ncommit: scan.ncommit,
            });
        }

        let log = UndoLog {
            region,
            tail: AtomicUsize::new(scan.tail),
            tx_active: AtomicBool::new(false),
        };

        if scan.nstart - scan.ncommit == 1 {
            log.recover(&scan, target)?;
        }

        Ok(log)
    }

    /// Byte offset where the next entry will be placed.
    pub fn tail(&self) -> usize {
        self.tail.load(Ordering::Acquire)
    }

    /// Release the handle; the region is handed back untouched.
    pub fn close(self) -> Region {
        self.region
    }

    /// Roll back the unfinished transaction found by `scan`, newest entry
    /// first, then seal it with a synthetic Commit.
    fn recover(&self, scan: &ScanResult, target: &mut dyn UndoTarget) -> Result<(), UndoLogError> {
        if let Some(pos) = scan.last_start_pos {
            log::warn!(
                "undo log: rolling back unfinished transaction ({} entries)",
                scan.entries.len() - pos - 1
            );
        }
        self.rollback_open_tx(scan, target)?;
        log::warn!("undo log: rollback complete, synthetic commit written");
        Ok(())
    }

    /// Apply the open transaction's pre-images newest-first through
    /// `target`, then seal the transaction with a Commit entry.
    fn rollback_open_tx(
        &self,
        scan: &ScanResult,
        target: &mut dyn UndoTarget,
    ) -> Result<(), UndoLogError> {
        let open_start = match scan.last_start_pos {
            Some(pos) => pos,
            None => {
                return Err(UndoLogError::Inconsistent {
                    nstart: scan.nstart,
                    ncommit: scan.ncommit,
                })
            }
        };

        for (_, entry) in scan.entries[open_start + 1..].iter().rev() {
            match entry {
                UndoEntry::Balloc {
                    start_block,
                    nblk,
                    orig_val,
                } => target.restore_balloc(*start_block, *nblk, *orig_val)?,
                UndoEntry::Idx {
                    dev_byte_offset,
                    original,
                } => target.restore_index_bytes(*dev_byte_offset, original)?,
                UndoEntry::Skip { .. } => {}
                UndoEntry::Start | UndoEntry::Commit => {
                    // Counted during the scan; cannot appear inside the
                    // window of a single open transaction.
                    return Err(UndoLogError::Inconsistent {
                        nstart: scan.nstart,
                        ncommit: scan.ncommit,
                    });
                }
            }
        }

        self.append(&UndoEntry::Commit)
    }

    // ── Transaction protocol ────────────────────────────────────────────────

    /// Open a transaction. Exactly one may be in flight per log.
    pub fn start_tx(&self) -> Result<(), UndoLogError> {
        if self
            .tx_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(UndoLogError::TxAlreadyActive);
        }
        self.append(&UndoEntry::Start)
    }

    /// Seal the open transaction; its entries become dead weight until the
    /// next [`UndoLog::truncate`].
    pub fn commit_tx(&self) -> Result<(), UndoLogError> {
        if self
            .tx_active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(UndoLogError::TxNotActive);
        }
        self.append(&UndoEntry::Commit)
    }

    /// Abandon the open transaction in place: the in-process mirror of
    /// crash recovery. Pre-images logged since the Start are applied
    /// newest-first through `target`, a synthetic Commit seals the window,
    /// and the transaction flag is released so the log stays usable.
    pub fn abort_tx(&self, target: &mut dyn UndoTarget) -> Result<(), UndoLogError> {
        if !self.tx_active.load(Ordering::Acquire) {
            return Err(UndoLogError::TxNotActive);
        }
        let scan = scan_region(&self.region)?;
        self.rollback_open_tx(&scan, target)?;
        if self
            .tx_active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(UndoLogError::TxNotActive);
        }
        Ok(())
    }

    /// Record the pre-image of a block-allocation-bitmap change.
    pub fn log_balloc(
        &self,
        start_block: u64,
        nblk: u32,
        orig_val: u8,
    ) -> Result<(), UndoLogError> {
        self.append(&UndoEntry::Balloc {
            start_block,
            nblk,
            orig_val,
        })
    }

    /// Record the pre-image of a persistent index byte range.
    pub fn log_idx(&self, dev_byte_offset: u64, original: &[u8]) -> Result<(), UndoLogError> {
        self.append(&UndoEntry::Idx {
            dev_byte_offset,
            original: original.to_vec(),
        })
    }

    /// Discard all entries. Only legal between transactions.
    pub fn truncate(&self) -> Result<(), UndoLogError> {
        if self.tx_active.load(Ordering::Acquire) {
            return Err(UndoLogError::TxAlreadyActive);
        }
        self.region.atomic_u8(OFF_TYPE)?.store(
            EntryType::Uninitialized as u8,
            Ordering::Release,
        );
        self.region.persist(OFF_TYPE, 1)?;
        self.tail.store(0, Ordering::Release);
        Ok(())
    }

    /// Walk the log, reporting each entry; returns the decoded entries.
    pub fn sanity_check(&self) -> Result<Vec<(usize, UndoEntry)>, UndoLogError> {
        let scan = scan_region(&self.region)?;
        for (off, entry) in &scan.entries {
            log::debug!("[{:8}] {:?}", off, entry);
        }
        Ok(scan.entries)
    }

    // ── Entry writing ───────────────────────────────────────────────────────

    /// Claim log space for `len` bytes, padding out the region tail with a
    /// Skip entry when the entry would cross the end.
    fn claim(&self, len: usize) -> Result<usize, UndoLogError> {
        let logsz = self.region.len();
        if len + ENTRY_UNIT > logsz {
            return Err(UndoLogError::EntryTooLarge { nbytes: len });
        }
        loop {
            let cur = self.tail.load(Ordering::Acquire);
            if cur + len <= logsz {
                if self
                    .tail
                    .compare_exchange(cur, cur + len, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(cur);
                }
                continue;
            }
            // Wrap: claim [cur, logsz) as Skip padding plus [0, len) for the
            // entry. A tail already flush with the end needs no padding.
            if self
                .tail
                .compare_exchange(cur, len, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if cur < logsz {
                    self.write_entry(
                        cur,
                        &UndoEntry::Skip {
                            skip_bytes: (logsz - cur) as u64,
                        },
                    )?;
                }
                return Ok(0);
            }
        }
    }

    fn append(&self, entry: &UndoEntry) -> Result<(), UndoLogError> {
        let offset = self.claim(entry.media_len())?;
        self.write_entry(offset, entry)
    }

    /// Two-phase entry write at a claimed offset.
    fn write_entry(&self, offset: usize, entry: &UndoEntry) -> Result<(), UndoLogError> {
        let r = &self.region;
        let len = entry.media_len();

        // Phase 1: payload.
        match entry {
            UndoEntry::Start | UndoEntry::Commit => {}
            UndoEntry::Skip { skip_bytes } => {
                r.write(offset + OFF_SKIP_BYTES, &skip_bytes.to_le_bytes())?;
            }
            UndoEntry::Balloc {
                start_block,
                nblk,
                orig_val,
            } => {
                r.write(offset + OFF_BALLOC_START, &start_block.to_le_bytes())?;
                r.write(offset + OFF_BALLOC_NBLK, &nblk.to_le_bytes())?;
                r.write(offset + OFF_BALLOC_ORIG, &[*orig_val])?;
            }
            UndoEntry::Idx {
                dev_byte_offset,
                original,
            } => {
                r.write(offset + OFF_IDX_DEV_OFF, &dev_byte_offset.to_le_bytes())?;
                r.write(
                    offset + OFF_IDX_NBYTES,
                    &(original.len() as u64).to_le_bytes(),
                )?;
                r.write(offset + OFF_IDX_DATA, original)?;
            }
        }
        r.persist(offset, len)?;

        // Phase 2a: make sure the scan stops right after this entry.
        let next = (offset + len) % r.len();
        r.atomic_u8(next + OFF_TYPE)?
            .store(EntryType::Uninitialized as u8, Ordering::Release);
        r.persist(next + OFF_TYPE, 1)?;

        // Phase 2b: publish the entry with a single-byte store.
        let ty = match entry {
            UndoEntry::Start => EntryType::Start,
            UndoEntry::Commit => EntryType::Commit,
            UndoEntry::Skip { .. } => EntryType::Skip,
            UndoEntry::Balloc { .. } => EntryType::Balloc,
            UndoEntry::Idx { .. } => EntryType::Idx,
        };
        r.atomic_u8(offset + OFF_TYPE)?
            .store(ty as u8, Ordering::Release);
        r.persist(offset + OFF_TYPE, 1)?;
        Ok(())
    }
}

impl fmt::Debug for UndoLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoLog")
            .field("len", &self.region.len())
            .field("tail", &self.tail())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scanning
// ─────────────────────────────────────────────────────────────────────────────

struct ScanResult {
    entries: Vec<(usize, UndoEntry)>,
    nstart: u32,
    ncommit: u32,
    /// Index into `entries` of the most recent Start.
    last_start_pos: Option<usize>,
    tail: usize,
}

fn read_u64_at(region: &Region, offset: usize) -> Result<u64, StorageError> {
    let mut buf = [0u8; 8];
    region.read(offset, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_u32_at(region: &Region, offset: usize) -> Result<u32, StorageError> {
    let mut buf = [0u8; 4];
    region.read(offset, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Walk entries from the base until the Uninitialized tail sentinel.
fn scan_region(region: &Region) -> Result<ScanResult, UndoLogError> {
    let logsz = region.len();
    let mut entries = Vec::new();
    let mut nstart = 0u32;
    let mut ncommit = 0u32;
    let mut last_start_pos = None;
    let mut offset = 0usize;
    // A full wrap without hitting the sentinel means the tail marker was
    // lost; treat as corruption rather than looping forever.
    let mut walked = 0usize;

    loop {
        if walked >= logsz {
            return Err(UndoLogError::Corrupt {
                offset,
                type_byte: u8::MAX,
            });
        }
        let mut ty = [0u8; 1];
        region.read(offset + OFF_TYPE, &mut ty)?;
        let ty = match EntryType::from_byte(ty[0]) {
            Some(t) => t,
            None => {
                return Err(UndoLogError::Corrupt {
                    offset,
                    type_byte: ty[0],
                })
            }
        };

        let (entry, len) = match ty {
            EntryType::Uninitialized => {
                return Ok(ScanResult {
                    entries,
                    nstart,
                    ncommit,
                    last_start_pos,
                    tail: offset,
                })
            }
            EntryType::Start => (UndoEntry::Start, ENTRY_UNIT),
            EntryType::Commit => (UndoEntry::Commit, ENTRY_UNIT),
            EntryType::Skip => {
                let skip_bytes = read_u64_at(region, offset + OFF_SKIP_BYTES)?;
                (UndoEntry::Skip { skip_bytes }, skip_bytes as usize)
            }
            EntryType::Balloc => {
                let start_block = read_u64_at(region, offset + OFF_BALLOC_START)?;
                let nblk = read_u32_at(region, offset + OFF_BALLOC_NBLK)?;
                let mut orig = [0u8; 1];
                region.read(offset + OFF_BALLOC_ORIG, &mut orig)?;
                (
                    UndoEntry::Balloc {
                        start_block,
                        nblk,
                        orig_val: orig[0],
                    },
                    ENTRY_UNIT,
                )
            }
            EntryType::Idx => {
                let dev_byte_offset = read_u64_at(region, offset + OFF_IDX_DEV_OFF)?;
                let nbytes = read_u64_at(region, offset + OFF_IDX_NBYTES)? as usize;
                if offset + OFF_IDX_DATA + nbytes > logsz {
                    return Err(UndoLogError::Corrupt {
                        offset,
                        type_byte: EntryType::Idx as u8,
                    });
                }
                let mut original = vec![0u8; nbytes];
                region.read(offset + OFF_IDX_DATA, &mut original)?;
                (
                    UndoEntry::Idx {
                        dev_byte_offset,
                        original,
                    },
                    round_unit(OFF_IDX_DATA + nbytes),
                )
            }
        };

        if len == 0 || len % ENTRY_UNIT != 0 {
            return Err(UndoLogError::Corrupt {
                offset,
                type_byte: ty as u8,
            });
        }

        match entry {
            UndoEntry::Start => {
                nstart += 1;
                last_start_pos = Some(entries.len());
            }
            UndoEntry::Commit => ncommit += 1,
            _ => {}
        }
        entries.push((offset, entry));

        walked += len;
        offset = (offset + len) % logsz;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_log(units: usize) -> UndoLog {
        let region = Region::anonymous(units * ENTRY_UNIT).unwrap();
        UndoLog::open(region, &mut NoopTarget).unwrap()
    }

    #[test]
    fn zero_filled_region_is_an_empty_log() {
        let log = fresh_log(64);
        assert_eq!(log.tail(), 0);
        assert!(log.sanity_check().unwrap().is_empty());
    }

    #[test]
    fn tx_bracket_round_trips() {
        let log = fresh_log(64);
        log.start_tx().unwrap();
        log.log_balloc(100, 4, 0b0011_0000).unwrap();
        log.commit_tx().unwrap();

        let entries: Vec<UndoEntry> =
            log.sanity_check().unwrap().into_iter().map(|(_, e)| e).collect();
        assert_eq!(
            entries,
            vec![
                UndoEntry::Start,
                UndoEntry::Balloc {
                    start_block: 100,
                    nblk: 4,
                    orig_val: 0b0011_0000
                },
                UndoEntry::Commit,
            ]
        );
    }

    #[test]
    fn double_start_is_rejected() {
        let log = fresh_log(64);
        log.start_tx().unwrap();
        assert!(matches!(log.start_tx(), Err(UndoLogError::TxAlreadyActive)));
        log.commit_tx().unwrap();
        assert!(matches!(log.commit_tx(), Err(UndoLogError::TxNotActive)));
    }

    #[test]
    fn abort_rolls_back_and_reopens_the_log() {
        #[derive(Default)]
        struct Recorder {
            calls: Vec<(u64, u32, u8)>,
        }
        impl UndoTarget for Recorder {
            fn restore_balloc(
                &mut self,
                start_block: u64,
                nblk: u32,
                orig_val: u8,
            ) -> Result<(), StorageError> {
                self.calls.push((start_block, nblk, orig_val));
                Ok(())
            }
            fn restore_index_bytes(&mut self, _: u64, _: &[u8]) -> Result<(), StorageError> {
                Ok(())
            }
        }

        let log = fresh_log(64);
        log.start_tx().unwrap();
        log.log_balloc(3, 1, 0x01).unwrap();
        log.log_balloc(4, 1, 0x03).unwrap();

        let mut rec = Recorder::default();
        log.abort_tx(&mut rec).unwrap();
        // Newest pre-image first, exactly like crash recovery.
        assert_eq!(rec.calls, vec![(4, 1, 0x03), (3, 1, 0x01)]);

        // Sealed with a Commit; the flag is free for the next transaction.
        assert_eq!(log.sanity_check().unwrap().last().unwrap().1, UndoEntry::Commit);
        log.start_tx().unwrap();
        log.commit_tx().unwrap();
    }

    #[test]
    fn abort_without_a_transaction_is_rejected() {
        let log = fresh_log(64);
        assert!(matches!(
            log.abort_tx(&mut NoopTarget),
            Err(UndoLogError::TxNotActive)
        ));
        log.start_tx().unwrap();
        log.abort_tx(&mut NoopTarget).unwrap();
        assert!(matches!(
            log.abort_tx(&mut NoopTarget),
            Err(UndoLogError::TxNotActive)
        ));
    }

    #[test]
    fn idx_entries_round_trip_with_padding() {
        let log = fresh_log(64);
        log.start_tx().unwrap();
        let original = vec![7u8; 100]; // 24 + 100 rounds to 128
        log.log_idx(4096, &original).unwrap();
        log.commit_tx().unwrap();

        let entries = log.sanity_check().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[1].1,
            UndoEntry::Idx {
                dev_byte_offset: 4096,
                original
            }
        );
        // 64 (start) + 128 (idx) + 64 (commit)
        assert_eq!(log.tail(), 256);
    }

    #[test]
    fn truncate_empties_the_log() {
        let log = fresh_log(64);
        log.start_tx().unwrap();
        log.log_balloc(1, 1, 0).unwrap();
        log.commit_tx().unwrap();
        log.truncate().unwrap();
        assert_eq!(log.tail(), 0);
        assert!(log.sanity_check().unwrap().is_empty());
    }

    #[test]
    fn wrap_pads_the_tail_and_restarts_at_base() {
        // 8 units of space. Seven single-unit entries leave one unit at the
        // end; a two-unit Idx entry cannot fit there and must wrap.
        let log = fresh_log(8);
        log.start_tx().unwrap();
        for i in 0..6 {
            log.log_balloc(i, 1, 0).unwrap();
        }
        assert_eq!(log.tail(), 7 * ENTRY_UNIT);
        log.log_idx(0, &[9u8; 100]).unwrap(); // 24 + 100 rounds to 2 units
        assert_eq!(log.tail(), 2 * ENTRY_UNIT);

        // The wrapped entry now heads the log; the scan stops right after it.
        let entries = log.sanity_check().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0].1, UndoEntry::Idx { .. }));

        // The padding Skip sits in the stale tail, beyond the scan window.
        let region = log.close();
        let mut ty = [0u8; 1];
        region.read(7 * ENTRY_UNIT, &mut ty).unwrap();
        assert_eq!(ty[0], EntryType::Skip as u8);
        let mut skip = [0u8; 8];
        region.read(7 * ENTRY_UNIT + OFF_SKIP_BYTES, &mut skip).unwrap();
        assert_eq!(u64::from_le_bytes(skip), ENTRY_UNIT as u64);
    }

    #[test]
    fn recovery_applies_preimages_in_reverse() {
        #[derive(Default)]
        struct Recorder {
            calls: Vec<(u64, u32, u8)>,
        }
        impl UndoTarget for Recorder {
            fn restore_balloc(
                &mut self,
                start_block: u64,
                nblk: u32,
                orig_val: u8,
            ) -> Result<(), StorageError> {
                self.calls.push((start_block, nblk, orig_val));
                Ok(())
            }
            fn restore_index_bytes(&mut self, _: u64, _: &[u8]) -> Result<(), StorageError> {
                Ok(())
            }
        }

        // Build a log with an unfinished transaction, then drop the handle
        // (simulating a crash before commit).
        let region = {
            let log = fresh_log(64);
            log.start_tx().unwrap();
            log.log_balloc(10, 1, 0xAA).unwrap();
            log.log_balloc(20, 2, 0xBB).unwrap();
            log.close()
        };

        let mut rec = Recorder::default();
        let log = UndoLog::open(region, &mut rec).unwrap();
        // Newest pre-image first.
        assert_eq!(rec.calls, vec![(20, 2, 0xBB), (10, 1, 0xAA)]);

        // The synthetic commit sealed the transaction.
        let entries = log.sanity_check().unwrap();
        assert_eq!(entries.last().unwrap().1, UndoEntry::Commit);
        // A second open has nothing left to do.
        let region = log.close();
        let mut rec2 = Recorder::default();
        UndoLog::open(region, &mut rec2).unwrap();
        assert!(rec2.calls.is_empty());
    }

    #[test]
    fn commit_count_above_start_count_is_inconsistent() {
        // Hand-craft a lone Commit entry: a commit without a start is a bug,
        // not a crash shape, and must abort rather than "recover".
        let region = Region::anonymous(64 * ENTRY_UNIT).unwrap();
        region.write(OFF_TYPE, &[EntryType::Commit as u8]).unwrap();
        assert!(matches!(
            UndoLog::open(region, &mut NoopTarget),
            Err(UndoLogError::Inconsistent {
                nstart: 0,
                ncommit: 1
            })
        ));
    }

    #[test]
    fn undefined_type_byte_is_corruption() {
        let region = Region::anonymous(64 * ENTRY_UNIT).unwrap();
        region.write(OFF_TYPE, &[0x7F]).unwrap();
        assert!(matches!(
            UndoLog::open(region, &mut NoopTarget),
            Err(UndoLogError::Corrupt {
                offset: 0,
                type_byte: 0x7F
            })
        ));
    }
}
