//! The persistent hash index: a flat array of 64-bit slots where the slot's
//! position *is* the mapped physical block.
//!
//! Slot `i` always maps to physical block `entries_blk + meta_size + i`;
//! there is no value field to load, so a probe touches one cacheline per
//! step. Mutation is lock-free: a slot is claimed by a single 64-bit CAS
//! whose expected value is the sentinel (Empty or Tombstone) observed there,
//! and made durable by an immediate persist of those 8 bytes.
//!
//! Submodules:
//! - [`probe`] — slot-visit order and table parameters (prime modulus, mask)
//! - [`batch`] — 8-wide batched lookup path
//! - [`locks`] — optional per-slot rwlock alternative to the CAS hot path
//! - [`stats`] — advisory per-call counters

pub mod batch;
pub mod locks;
pub mod probe;
pub mod stats;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::config::BLOCK_SIZE_BYTES;
use crate::hash::HashChoice;
use crate::key::{self, SlotState, EMPTY, TOMBSTONE};
use crate::meta::{self, Meta, VALID_MAGIC};
use crate::storage::{Region, StorageError};
use crate::types::{PAddr, Superblock};

use locks::SlotLocks;
use probe::ProbeSeq;
use stats::{IndexStats, StatsSnapshot};

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors returned by index operations.
#[derive(Debug)]
pub enum IndexError {
    /// The key encodes one of the reserved slot sentinels.
    ReservedKey,
    /// Insert found the key already present.
    Exists,
    /// The probe sequence exhausted `mod` steps without a usable slot.
    /// Not recoverable without an external resize.
    TableFull,
    /// A persist failed earlier; the index refuses all further operations.
    Poisoned,
    /// Storage-port failure during construction.
    Storage(StorageError),
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::ReservedKey => f.write_str("key collides with a reserved sentinel"),
            IndexError::Exists => f.write_str("key already present"),
            IndexError::TableFull => f.write_str("hash table full"),
            IndexError::Poisoned => f.write_str("index poisoned by an earlier persist failure"),
            IndexError::Storage(e) => write!(f, "storage: {}", e),
        }
    }
}

impl std::error::Error for IndexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IndexError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for IndexError {
    fn from(e: StorageError) -> Self {
        IndexError::Storage(e)
    }
}

// Storage variants carry io error payloads and never compare equal; the
// stateless variants compare by discriminant.
impl PartialEq for IndexError {
    fn eq(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (IndexError::ReservedKey, IndexError::ReservedKey)
                | (IndexError::Exists, IndexError::Exists)
                | (IndexError::TableFull, IndexError::TableFull)
                | (IndexError::Poisoned, IndexError::Poisoned)
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HashIndex
// ─────────────────────────────────────────────────────────────────────────────

/// Volatile handle to one persistent hash table.
///
/// The handle owns the mapped region for its lifetime and caches the
/// immutable table parameters; everything mutable lives in the region
/// itself. All operations take `&self` — the handle is `Sync` and callers
/// may share it across threads freely.
pub struct HashIndex {
    region: Region,
    meta: Meta,
    hash: HashChoice,
    // Cached immutable parameters (also present in the meta block).
    entries_base: usize,
    entries_blk: u64,
    meta_size: u32,
    num_entries: u64,
    modulus: u32,
    poisoned: AtomicBool,
    locks: SlotLocks,
    stats: IndexStats,
}

impl HashIndex {
    /// Attach to the table at `sblk.datablock_start`, or format one if the
    /// meta block does not carry the valid magic.
    ///
    /// Format order is fixed: every slot is set Empty and flushed, then the
    /// meta fields are written and flushed, then `valid` is set and flushed.
    /// A crash anywhere before the final flush leaves an invalid meta block
    /// and the next attach formats again from scratch.
    pub fn new(region: Region, sblk: &Superblock, hash: HashChoice) -> Result<HashIndex, IndexError> {
        let meta = Meta::at_block(&region, sblk.datablock_start)?;

        if meta.valid(&region)? == VALID_MAGIC {
            let entries_blk = meta.entries_blk(&region)?;
            let meta_size = meta.meta_size(&region)?;
            let num_entries = meta.num_entries(&region)?;
            let modulus = meta.modulus(&region)?;
            let entries_base = entries_blk as usize * BLOCK_SIZE_BYTES;
            Self::check_entries_fit(&region, entries_base, num_entries)?;
            log::info!(
                "hash table exists: {} slots, mod {}, {} live",
                num_entries,
                modulus,
                meta.nnodes(&region)?
            );
            return Ok(HashIndex {
                locks: SlotLocks::new(num_entries as usize),
                stats: IndexStats::new(crate::config::profile_enabled()),
                region,
                meta,
                hash,
                entries_base,
                entries_blk,
                meta_size,
                num_entries,
                modulus,
                poisoned: AtomicBool::new(false),
            });
        }

        // Uninitialized (or torn) meta: rebuild the whole table in place.
        let meta_size = 1u32;
        let entries_blk = sblk.datablock_start + 1;
        let num_entries = sblk.ndatablocks;
        let entries_base = entries_blk as usize * BLOCK_SIZE_BYTES;
        if num_entries < 2 {
            return Err(IndexError::Storage(StorageError::EmptyRegion));
        }
        Self::check_entries_fit(&region, entries_base, num_entries)?;
        let modulus = probe::largest_prime_le(num_entries.min(u32::MAX as u64) as u32);
        let mask = probe::pow2_mask_below(num_entries);

        log::info!(
            "formatting hash table: {} slots at block {}, mod {}",
            num_entries,
            entries_blk,
            modulus
        );

        // Every byte 0xFF is the Empty sentinel in every slot.
        let table_bytes = num_entries as usize * 8;
        region.fill(entries_base, table_bytes, 0xFF)?;
        region.persist(entries_base, table_bytes)?;

        meta.set_is_pmem(&region, region.is_pmem())?;
        meta.set_meta_size(&region, meta_size)?;
        meta.set_size(&region, num_entries.min(u32::MAX as u64) as u32)?;
        meta.set_modulus(&region, modulus)?;
        meta.set_mask(&region, mask)?;
        meta.set_nnodes(&region, 0)?;
        meta.set_noccupied(&region, 0)?;
        meta.set_entries_blk(&region, entries_blk)?;
        meta.set_num_entries(&region, num_entries)?;
        meta.clear_reserved(&region)?;
        meta.persist_all(&region)?;

        meta.set_valid(&region, VALID_MAGIC)?;
        meta.persist_field(&region, meta::OFF_VALID, 4)?;

        Ok(HashIndex {
            locks: SlotLocks::new(num_entries as usize),
            stats: IndexStats::new(crate::config::profile_enabled()),
            region,
            meta,
            hash,
            entries_base,
            entries_blk,
            meta_size,
            num_entries,
            modulus,
            poisoned: AtomicBool::new(false),
        })
    }

    fn check_entries_fit(
        region: &Region,
        entries_base: usize,
        num_entries: u64,
    ) -> Result<(), IndexError> {
        let need = (num_entries as usize)
            .checked_mul(8)
            .and_then(|b| b.checked_add(entries_base));
        match need {
            Some(end) if end <= region.len() => Ok(()),
            _ => Err(IndexError::Storage(StorageError::OutOfBounds {
                offset: entries_base,
                len: num_entries as usize * 8,
            })),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    /// Block number where the entry table begins.
    #[inline]
    pub fn entries_blk(&self) -> u64 {
        self.entries_blk
    }

    /// Blocks occupied by the meta region.
    #[inline]
    pub fn meta_size(&self) -> u32 {
        self.meta_size
    }

    /// Total slot count.
    #[inline]
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Prime probe modulus.
    #[inline]
    pub fn modulus(&self) -> u32 {
        self.modulus
    }

    /// The hash function this handle probes with.
    #[inline]
    pub fn hash_choice(&self) -> HashChoice {
        self.hash
    }

    /// Live-key count (advisory).
    pub fn size(&self) -> u32 {
        self.meta.nnodes(&self.region).unwrap_or(0)
    }

    /// Live + tombstone count (advisory).
    pub fn occupied(&self) -> u32 {
        self.meta.noccupied(&self.region).unwrap_or(0)
    }

    /// Advisory per-call counters (all zero unless profiling is enabled).
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Release the volatile handle; the persistent region is untouched and
    /// handed back to the caller.
    pub fn close(self) -> Region {
        self.region
    }

    /// Physical block addressed by slot `idx`.
    #[inline]
    fn pblk(&self, idx: u32) -> PAddr {
        self.entries_blk + self.meta_size as u64 + idx as u64
    }

    #[inline]
    fn slot_cell(&self, idx: u32) -> Result<&AtomicU64, IndexError> {
        Ok(self.region.atomic_u64(self.entries_base + idx as usize * 8)?)
    }

    /// Raw slot value; media is little-endian.
    #[inline]
    fn load_slot(&self, idx: u32) -> Result<u64, IndexError> {
        Ok(u64::from_le(self.slot_cell(idx)?.load(Ordering::Acquire)))
    }

    fn persist_slot(&self, idx: u32) -> Result<(), IndexError> {
        self.persist_or_poison(self.entries_base + idx as usize * 8, 8)
    }

    /// Persist, marking the index unusable if the storage port fails.
    fn persist_or_poison(&self, offset: usize, len: usize) -> Result<(), IndexError> {
        match self.region.persist(offset, len) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::error!("persist failed, poisoning index: {}", e);
                self.poisoned.store(true, Ordering::SeqCst);
                Err(IndexError::Poisoned)
            }
        }
    }

    /// Best-effort counter update; counters are advisory statistics.
    fn bump_counters(&self, nnodes_delta: i32, noccupied_delta: i32) -> Result<(), IndexError> {
        self.meta
            .counter_add(&self.region, meta::OFF_NNODES, nnodes_delta)?;
        if noccupied_delta != 0 {
            self.meta
                .counter_add(&self.region, meta::OFF_NOCCUPIED, noccupied_delta)?;
        }
        // nnodes and noccupied are adjacent; one persist covers both.
        self.persist_or_poison(self.meta.byte_base() + meta::OFF_NNODES, 8)
    }

    #[inline]
    fn guard(&self, key: u64) -> Result<(), IndexError> {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(IndexError::Poisoned);
        }
        if key::is_sentinel(key) {
            return Err(IndexError::ReservedKey);
        }
        Ok(())
    }

    // ── Lookup ──────────────────────────────────────────────────────────────

    /// Find `key`; `Some(physical block)` when present. Never writes.
    pub fn lookup(&self, key: u64) -> Result<Option<PAddr>, IndexError> {
        self.guard(key)?;
        if cfg!(feature = "batch-probe") && !crate::config::SLOT_LOCKS {
            return self.lookup_batched(key);
        }
        self.lookup_scalar(key)
    }

    fn lookup_scalar(&self, key: u64) -> Result<Option<PAddr>, IndexError> {
        let mut probe = ProbeSeq::new(self.hash.seed(key), self.modulus);
        while let Some(idx) = probe.next() {
            let _g = self.locks.read(idx);
            match SlotState::from_raw(self.load_slot(idx)?) {
                SlotState::Empty => {
                    self.stats.record_lookup(probe.steps() as u64);
                    return Ok(None);
                }
                SlotState::Valid(k) if k == key => {
                    self.stats.record_lookup(probe.steps() as u64);
                    return Ok(Some(self.pblk(idx)));
                }
                _ => {}
            }
        }
        self.stats.record_lookup(probe.steps() as u64);
        Ok(None)
    }

    /// 8-wide block scan over the triangular offset schedule; falls back to
    /// the scalar probe when the schedule is exhausted.
    fn lookup_batched(&self, key: u64) -> Result<Option<PAddr>, IndexError> {
        let bucket = self.hash.seed(key) % self.modulus;
        let mut lanes = [0u64; batch::BATCH_WIDTH];
        for &off in batch::PROBE_BLOCK_OFFSETS.iter() {
            let base = (bucket as u64 + off as u64) % self.modulus as u64;
            for (lane, slot) in lanes.iter_mut().enumerate() {
                let idx = ((base + lane as u64) % self.modulus as u64) as u32;
                *slot = self.load_slot(idx)?;
            }
            match batch::scan_block(&lanes, key) {
                batch::BlockScan::Hit(lane) => {
                    let idx = ((base + lane as u64) % self.modulus as u64) as u32;
                    return Ok(Some(self.pblk(idx)));
                }
                batch::BlockScan::End => return Ok(None),
                batch::BlockScan::Continue => {}
            }
        }
        self.lookup_scalar(key)
    }

    // ── Insert ──────────────────────────────────────────────────────────────

    /// Map `key` to the fixed physical block of a free slot on its chain.
    ///
    /// The probe must run past tombstones until an Empty slot (or the key
    /// itself) is seen, otherwise a duplicate sitting later in the chain
    /// could be missed; only then does the first tombstone become the
    /// claim candidate.
    pub fn insert(&self, key: u64) -> Result<PAddr, IndexError> {
        self.guard(key)?;
        let mut probe = ProbeSeq::new(self.hash.seed(key), self.modulus);
        // Candidate slot plus the probe step in force there, so the claim
        // walk can resume on the same chain.
        let mut first_tombstone: Option<(u32, u32)> = None;
        let mut candidate: Option<(u32, u32)> = None;

        while let Some(idx) = probe.next() {
            let _g = self.locks.write(idx);
            match SlotState::from_raw(self.load_slot(idx)?) {
                SlotState::Valid(k) if k == key => {
                    log::debug!("insert: key {:#x} already present at slot {}", key, idx);
                    return Err(IndexError::Exists);
                }
                SlotState::Valid(_) => {}
                SlotState::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some((idx, probe.step_state()));
                    }
                }
                SlotState::Empty => {
                    candidate = Some(first_tombstone.unwrap_or((idx, probe.step_state())));
                    break;
                }
            }
        }

        let (start, step) = match candidate.or(first_tombstone) {
            Some(c) => c,
            None => return Err(IndexError::TableFull),
        };
        self.claim_from(key, start, step, probe.steps() as u64)
    }

    /// CAS-claim loop starting at `start`, resuming down the chain after a
    /// lost race. Each visited slot is re-classified immediately before the
    /// CAS, so the expected value is always the sentinel actually present.
    fn claim_from(&self, key: u64, start: u32, step: u32, chain: u64) -> Result<PAddr, IndexError> {
        let mut retry = ProbeSeq::resume_from(start, step, self.modulus);
        while let Some(idx) = retry.next() {
            let _g = self.locks.write(idx);
            loop {
                let expected = match SlotState::from_raw(self.load_slot(idx)?) {
                    // A racing insert of this same key may have won the slot
                    // we were about to claim.
                    SlotState::Valid(k) if k == key => return Err(IndexError::Exists),
                    SlotState::Valid(_) => break,
                    SlotState::Tombstone => TOMBSTONE,
                    SlotState::Empty => EMPTY,
                };
                let won = self
                    .slot_cell(idx)?
                    .compare_exchange(
                        expected.to_le(),
                        key.to_le(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();
                if won {
                    self.persist_slot(idx)?;
                    self.bump_counters(1, if expected == EMPTY { 1 } else { 0 })?;
                    self.stats.record_insert(chain + retry.steps() as u64);
                    return Ok(self.pblk(idx));
                }
                // Lost the CAS: the slot changed under us. Re-classify the
                // same slot before moving down the chain; the winner may
                // have installed exactly the key we are inserting.
            }
        }
        Err(IndexError::TableFull)
    }

    // ── Remove ──────────────────────────────────────────────────────────────

    /// Erase `key`, erecting a tombstone. `Some(physical block)` when the
    /// key was present. Tombstones persist until a colliding insert reuses
    /// them; they are never compacted back to Empty.
    pub fn remove(&self, key: u64) -> Result<Option<PAddr>, IndexError> {
        self.guard(key)?;
        let mut probe = ProbeSeq::new(self.hash.seed(key), self.modulus);
        while let Some(idx) = probe.next() {
            let _g = self.locks.write(idx);
            match SlotState::from_raw(self.load_slot(idx)?) {
                SlotState::Empty => {
                    self.stats.record_remove(probe.steps() as u64);
                    return Ok(None);
                }
                SlotState::Valid(k) if k == key => {
                    let won = self
                        .slot_cell(idx)?
                        .compare_exchange(
                            key.to_le(),
                            TOMBSTONE.to_le(),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok();
                    self.stats.record_remove(probe.steps() as u64);
                    if !won {
                        // A racing remove got there first; the key is gone.
                        return Ok(None);
                    }
                    self.persist_slot(idx)?;
                    self.bump_counters(-1, 0)?;
                    return Ok(Some(self.pblk(idx)));
                }
                _ => {}
            }
        }
        self.stats.record_remove(self.modulus as u64);
        Ok(None)
    }

    // ── Update (legacy) ─────────────────────────────────────────────────────

    /// Presence probe kept for the range-mapping façade's legacy callers.
    ///
    /// The slot layout carries no value field, so there is nothing to
    /// rewrite; range bookkeeping lives in the façade. Returns whether the
    /// key is present.
    pub fn update(&self, key: u64, _new_len: u32) -> Result<bool, IndexError> {
        Ok(self.lookup(key)?.is_some())
    }
}

impl fmt::Debug for HashIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashIndex")
            .field("entries_blk", &self.entries_blk)
            .field("num_entries", &self.num_entries)
            .field("modulus", &self.modulus)
            .field("hash", &self.hash)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::make_key;

    fn small_index() -> HashIndex {
        // 16 data blocks => 16 slots; table lives at block 0, entries at 1.
        let region = Region::anonymous(64 * BLOCK_SIZE_BYTES).unwrap();
        let sblk = Superblock::new(0, 16);
        HashIndex::new(region, &sblk, HashChoice::Direct).unwrap()
    }

    #[test]
    fn format_parameters() {
        let idx = small_index();
        assert_eq!(idx.entries_blk(), 1);
        assert_eq!(idx.meta_size(), 1);
        assert_eq!(idx.num_entries(), 16);
        assert_eq!(idx.modulus(), 13);
        assert_eq!(idx.size(), 0);
    }

    #[test]
    fn insert_lookup_remove_cycle() {
        let idx = small_index();
        let key = make_key(5, 0).unwrap();
        let pblk = idx.insert(key).unwrap();
        assert_eq!(idx.lookup(key).unwrap(), Some(pblk));
        assert_eq!(idx.size(), 1);
        assert_eq!(idx.remove(key).unwrap(), Some(pblk));
        assert_eq!(idx.lookup(key).unwrap(), None);
        assert_eq!(idx.size(), 0);
    }

    #[test]
    fn physical_block_is_slot_position() {
        let idx = small_index();
        let key = make_key(5, 0).unwrap();
        let pblk = idx.insert(key).unwrap();
        let expected_slot = HashChoice::Direct.seed(key) % idx.modulus();
        assert_eq!(pblk, idx.entries_blk() + idx.meta_size() as u64 + expected_slot as u64);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let idx = small_index();
        let key = make_key(1, 2).unwrap();
        idx.insert(key).unwrap();
        assert_eq!(idx.insert(key), Err(IndexError::Exists));
    }

    #[test]
    fn sentinels_are_refused() {
        let idx = small_index();
        assert_eq!(idx.insert(EMPTY), Err(IndexError::ReservedKey));
        assert_eq!(idx.insert(TOMBSTONE), Err(IndexError::ReservedKey));
        assert_eq!(idx.lookup(EMPTY), Err(IndexError::ReservedKey));
        assert_eq!(idx.remove(TOMBSTONE), Err(IndexError::ReservedKey));
    }

    #[test]
    fn tombstone_is_reused_by_colliding_insert() {
        let idx = small_index();
        // Direct hash: lblk is the seed, so these three collide mod 13.
        let a = make_key(1, 0).unwrap();
        let b = make_key(1, 13).unwrap();
        let c = make_key(1, 26).unwrap();
        let slot_a = idx.insert(a).unwrap();
        idx.insert(b).unwrap();
        idx.remove(a).unwrap();
        // c probes through a's tombstone; the tombstone must be the slot used.
        assert_eq!(idx.insert(c).unwrap(), slot_a);
    }

    #[test]
    fn remove_of_absent_key_is_none() {
        let idx = small_index();
        assert_eq!(idx.remove(make_key(9, 9).unwrap()).unwrap(), None);
    }

    #[test]
    fn update_reports_presence_only() {
        let idx = small_index();
        let key = make_key(3, 1).unwrap();
        assert!(!idx.update(key, 4).unwrap());
        let pblk = idx.insert(key).unwrap();
        assert!(idx.update(key, 4).unwrap());
        assert_eq!(idx.lookup(key).unwrap(), Some(pblk));
    }

    #[test]
    fn close_returns_region_with_table_intact() {
        let idx = small_index();
        let key = make_key(2, 2).unwrap();
        idx.insert(key).unwrap();
        let region = idx.close();
        let idx2 = HashIndex::new(region, &Superblock::new(0, 16), HashChoice::Direct).unwrap();
        assert!(idx2.lookup(key).unwrap().is_some());
    }
}
