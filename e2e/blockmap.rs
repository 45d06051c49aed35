//! E2E Suite 06: the range-mapping façade over index + undo log + bitmap.

extern crate hashfs;

use hashfs::{
    AllocError, BlockBitmap, BlockMap, BlockMapError, HashChoice, HashIndex, IndexError,
    NoopTarget, Region, Superblock, UndoLog, MAX_GET_BLOCKS_RETURN,
};

const BLOCK: usize = 4096;
const NDATA: u64 = 256;

fn fresh_map() -> BlockMap {
    let index_region = Region::anonymous(BLOCK + NDATA as usize * 8).expect("index region");
    let index = HashIndex::new(
        index_region,
        &Superblock::new(0, NDATA),
        HashChoice::Murmur64,
    )
    .expect("format index");

    let undo_region = Region::anonymous(64 * BLOCK).expect("undo region");
    let undo = UndoLog::open(undo_region, &mut NoopTarget).expect("open log");

    // The bitmap must cover every block the entry table can hand out.
    let bitmap_region = Region::anonymous(BLOCK).expect("bitmap region");
    let bitmap = BlockBitmap::new(bitmap_region, 2 + NDATA).expect("bitmap");

    BlockMap::new(index, undo, bitmap)
}

#[test]
fn create_then_get_round_trips() {
    let mut map = fresh_map();
    let created = map.create_blocks(1, 0, 8).expect("create");
    let total: u32 = created.iter().map(|r| r.count).sum();
    assert_eq!(total, 8);

    let fetched = map.get_blocks(1, 0, 8).expect("get");
    assert_eq!(fetched, created);
}

#[test]
fn created_blocks_are_marked_allocated() {
    let mut map = fresh_map();
    let runs = map.create_blocks(2, 0, 4).expect("create");
    let (_index, _undo, bitmap) = map.into_parts();
    for run in &runs {
        for i in 0..run.count as u64 {
            assert!(bitmap.is_set(run.pblk + i).expect("is_set"));
        }
    }
}

#[test]
fn get_blocks_stops_at_first_hole() {
    let mut map = fresh_map();
    map.create_blocks(3, 0, 3).expect("create 0..3");
    map.create_blocks(3, 5, 2).expect("create 5..7");

    // Blocks 3 and 4 are unmapped; the answer covers only 0..3.
    let runs = map.get_blocks(3, 0, 8).expect("get");
    let total: u32 = runs.iter().map(|r| r.count).sum();
    assert_eq!(total, 3);

    // Re-issuing from the hole's far side finds the second extent.
    let runs = map.get_blocks(3, 5, 3).expect("get");
    let total: u32 = runs.iter().map(|r| r.count).sum();
    assert_eq!(total, 2);
}

#[test]
fn requests_are_capped_per_call() {
    let mut map = fresh_map();
    map.create_blocks(4, 0, 20).expect("create");
    // Only the first MAX_GET_BLOCKS_RETURN blocks are handled per call; the
    // caller loops for the rest.
    let runs = map.get_blocks(4, 0, 20).expect("get");
    let total: u32 = runs.iter().map(|r| r.count).sum();
    assert_eq!(total, MAX_GET_BLOCKS_RETURN as u32);

    // The create call was capped the same way: block 8 was never mapped.
    let rest = map.get_blocks(4, 8, 8).expect("get");
    assert!(rest.is_empty());
}

#[test]
fn create_is_idempotent_for_mapped_blocks() {
    let mut map = fresh_map();
    let first = map.create_blocks(5, 0, 4).expect("create");
    // A second create over the same range allocates nothing new.
    let second = map.create_blocks(5, 0, 4).expect("recreate");
    assert_eq!(first, second);
    assert_eq!(map.index().size(), 4);
}

#[test]
fn truncate_unmaps_and_frees() {
    let mut map = fresh_map();
    let runs = map.create_blocks(6, 0, 6).expect("create");
    assert_eq!(map.truncate(6, 0, 5).expect("truncate"), 6);

    assert!(map.get_blocks(6, 0, 6).expect("get").is_empty());
    assert_eq!(map.index().size(), 0);

    let (_index, _undo, bitmap) = map.into_parts();
    for run in &runs {
        for i in 0..run.count as u64 {
            assert!(!bitmap.is_set(run.pblk + i).expect("is_set"));
        }
    }
}

#[test]
fn truncate_of_a_hole_removes_nothing() {
    let mut map = fresh_map();
    map.create_blocks(7, 0, 2).expect("create");
    assert_eq!(map.truncate(7, 10, 20).expect("truncate"), 0);
    assert_eq!(map.index().size(), 2);
}

#[test]
fn partial_truncate_keeps_the_rest() {
    let mut map = fresh_map();
    map.create_blocks(8, 0, 6).expect("create");
    assert_eq!(map.truncate(8, 2, 3).expect("truncate"), 2);

    let head: u32 = map
        .get_blocks(8, 0, 2)
        .expect("get")
        .iter()
        .map(|r| r.count)
        .sum();
    assert_eq!(head, 2);
    let tail: u32 = map
        .get_blocks(8, 4, 2)
        .expect("get")
        .iter()
        .map(|r| r.count)
        .sum();
    assert_eq!(tail, 2);
    assert_eq!(map.index().size(), 4);
}

#[test]
fn single_slot_runs_are_the_norm() {
    // Hash placement scatters adjacent logical blocks, so runs of length 1
    // dominate; the façade must return them individually, in order.
    let mut map = fresh_map();
    let runs = map.create_blocks(9, 0, 8).expect("create");
    let refetched = map.get_blocks(9, 0, 8).expect("get");
    assert_eq!(runs, refetched);
    assert!(runs.len() > 1, "256-slot table should scatter 8 blocks");
}

// ─────────────────────────────────────────────────────────────────────────────
// Failed requests must not wedge the façade's transaction flag
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn reserved_range_is_rejected_before_the_transaction_opens() {
    let mut map = fresh_map();

    // The last key of this range lands in the reserved sentinel domain.
    let err = map.create_blocks(u32::MAX, u32::MAX - 3, 3).unwrap_err();
    assert!(matches!(err, BlockMapError::Index(IndexError::ReservedKey)));
    let err = map.truncate(u32::MAX, 0, u32::MAX).unwrap_err();
    assert!(matches!(err, BlockMapError::Index(IndexError::ReservedKey)));

    // No transaction was opened, so ordinary requests still go through.
    let created: u32 = map
        .create_blocks(1, 0, 2)
        .expect("create after rejected range")
        .iter()
        .map(|r| r.count)
        .sum();
    assert_eq!(created, 2);
    assert_eq!(map.truncate(1, 0, 1).expect("truncate"), 2);
}

/// 16-slot table with direct hashing (slot = lblk, pblk = lblk + 2) over a
/// bitmap that only covers physical blocks 0..5 — the fourth allocation of
/// any create lands out of range.
fn cramped_map() -> BlockMap {
    let index_region = Region::anonymous(2 * BLOCK).expect("index region");
    let index = HashIndex::new(index_region, &Superblock::new(0, 16), HashChoice::Direct)
        .expect("format index");
    let undo_region = Region::anonymous(16 * BLOCK).expect("undo region");
    let undo = UndoLog::open(undo_region, &mut NoopTarget).expect("open log");
    let bitmap_region = Region::anonymous(BLOCK).expect("bitmap region");
    let bitmap = BlockBitmap::new(bitmap_region, 5).expect("bitmap");
    BlockMap::new(index, undo, bitmap)
}

#[test]
fn failed_allocation_rolls_the_transaction_back() {
    let mut map = cramped_map();

    // pblks 2, 3, 4 fit the bitmap; pblk 5 is out of range mid-request.
    let err = map.create_blocks(1, 0, 8).unwrap_err();
    assert!(matches!(
        err,
        BlockMapError::Alloc(AllocError::OutOfRange { block: 5 })
    ));

    // The abort replayed the logged pre-images: every bit set inside the
    // failed transaction is free again.
    let (index, undo, bitmap) = map.into_parts();
    for pblk in 2..5 {
        assert!(!bitmap.is_set(pblk).expect("is_set"));
    }
    let mut map = BlockMap::new(index, undo, bitmap);

    // The transaction flag is free: the next failure is the same clean
    // allocator error, not TxAlreadyActive...
    let err = map.create_blocks(1, 4, 1).unwrap_err();
    assert!(matches!(
        err,
        BlockMapError::Alloc(AllocError::OutOfRange { .. })
    ));

    // ...and a request that allocates nothing brackets and commits fine.
    assert_eq!(map.truncate(99, 0, 3).expect("truncate"), 0);
}
