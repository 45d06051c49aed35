//! E2E Suite 01: single-threaded index operations.
//!
//! Covers the core lookup/insert/remove contract:
//! - the positional physical-block formula
//! - probe chains across collisions
//! - tombstone reuse on insert
//! - duplicate and sentinel rejection
//! - lookup idempotence

extern crate hashfs;

use hashfs::{make_key, HashChoice, HashIndex, IndexError, Region, Superblock};

const BLOCK: usize = 4096;

/// Fresh table with `ndatablocks` slots, entries at block 1, direct hashing.
fn fresh_index(ndatablocks: u64) -> HashIndex {
    let bytes = BLOCK + (ndatablocks as usize * 8).max(BLOCK) + BLOCK;
    let region = Region::anonymous(bytes).expect("region");
    HashIndex::new(region, &Superblock::new(0, ndatablocks), HashChoice::Direct)
        .expect("format index")
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario: fresh table, mod 127, one insert
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn insert_lands_on_the_hash_slot() {
    let idx = fresh_index(128);
    assert_eq!(idx.modulus(), 127);

    let key = make_key(5, 0).expect("key");
    let pblk = idx.insert(key).expect("insert");

    let expected_slot = HashChoice::Direct.seed(key) % 127;
    assert_eq!(
        pblk,
        idx.entries_blk() + idx.meta_size() as u64 + expected_slot as u64
    );
    assert_eq!(idx.lookup(key).expect("lookup"), Some(pblk));
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario: remove then colliding insert reuses the tombstone
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn colliding_insert_reuses_removed_slot() {
    let idx = fresh_index(128);

    // Direct hash seeds with lblk, so lblk 0 keys all share bucket 0.
    let k10 = make_key(1, 0).expect("key");
    let k11 = make_key(1, 1).expect("key");
    let k20 = make_key(2, 0).expect("key");
    let k30 = make_key(3, 0).expect("key");

    let slot_k10 = idx.insert(k10).expect("insert (1,0)");
    idx.insert(k11).expect("insert (1,1)");
    idx.insert(k20).expect("insert (2,0)");

    assert_eq!(idx.remove(k10).expect("remove"), Some(slot_k10));

    // (3,0) probes through (1,0)'s old slot first; the tombstone is reused.
    let slot_k30 = idx.insert(k30).expect("insert (3,0)");
    assert_eq!(slot_k30, slot_k10);
    assert_eq!(idx.lookup(k30).expect("lookup"), Some(slot_k30));
}

#[test]
fn non_colliding_insert_ignores_foreign_tombstone() {
    let idx = fresh_index(128);
    let a = make_key(1, 5).expect("key");
    let b = make_key(1, 60).expect("key");
    let slot_a = idx.insert(a).expect("insert");
    idx.remove(a).expect("remove");

    // b's chain never passes slot 5, so the tombstone stays untouched.
    let slot_b = idx.insert(b).expect("insert");
    assert_ne!(slot_b, slot_a);
}

// ─────────────────────────────────────────────────────────────────────────────
// Independence: inserting one key never moves another
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn insert_does_not_disturb_other_keys() {
    let idx = fresh_index(128);
    let resident = make_key(7, 3).expect("key");
    let resident_slot = idx.insert(resident).expect("insert");

    for lblk in 0..40 {
        let k = make_key(9, lblk).expect("key");
        idx.insert(k).expect("insert");
        assert_eq!(idx.lookup(resident).expect("lookup"), Some(resident_slot));
    }
}

#[test]
fn physical_blocks_stay_inside_the_entry_table() {
    let idx = fresh_index(128);
    let base = idx.entries_blk() + idx.meta_size() as u64;
    for lblk in 0..50 {
        let k = make_key(4, lblk).expect("key");
        let pblk = idx.insert(k).expect("insert");
        assert!(pblk >= base);
        assert!(pblk < base + idx.num_entries());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Idempotence and error contract
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn lookup_is_idempotent_and_side_effect_free() {
    let idx = fresh_index(128);
    let key = make_key(2, 9).expect("key");
    let absent = make_key(2, 10).expect("key");
    let pblk = idx.insert(key).expect("insert");

    for _ in 0..100 {
        assert_eq!(idx.lookup(key).expect("lookup"), Some(pblk));
        assert_eq!(idx.lookup(absent).expect("lookup"), None);
    }
    assert_eq!(idx.size(), 1);
}

#[test]
fn remove_then_lookup_is_none_either_way() {
    let idx = fresh_index(128);
    let present = make_key(1, 1).expect("key");
    let never = make_key(1, 2).expect("key");

    idx.insert(present).expect("insert");
    idx.remove(present).expect("remove");
    assert_eq!(idx.lookup(present).expect("lookup"), None);

    assert_eq!(idx.remove(never).expect("remove"), None);
    assert_eq!(idx.lookup(never).expect("lookup"), None);
}

#[test]
fn double_insert_returns_exists() {
    let idx = fresh_index(128);
    let key = make_key(6, 6).expect("key");
    idx.insert(key).expect("insert");
    assert_eq!(idx.insert(key), Err(IndexError::Exists));
}

#[test]
fn reinsert_after_remove_succeeds() {
    let idx = fresh_index(128);
    let key = make_key(6, 7).expect("key");
    let first = idx.insert(key).expect("insert");
    idx.remove(key).expect("remove");
    // The chain is unchanged, so the tombstone (the old slot) is reused.
    assert_eq!(idx.insert(key).expect("reinsert"), first);
}

#[test]
fn reserved_sentinel_keys_are_refused() {
    let idx = fresh_index(128);
    assert_eq!(idx.insert(u64::MAX), Err(IndexError::ReservedKey));
    assert_eq!(idx.insert(u64::MAX - 1), Err(IndexError::ReservedKey));
    assert_eq!(idx.lookup(u64::MAX), Err(IndexError::ReservedKey));
    assert_eq!(idx.remove(u64::MAX - 1), Err(IndexError::ReservedKey));
    // The encoder refuses to build them in the first place.
    assert_eq!(make_key(u32::MAX, u32::MAX), Err(IndexError::ReservedKey));
    assert_eq!(
        make_key(u32::MAX, u32::MAX - 1),
        Err(IndexError::ReservedKey)
    );
}

#[test]
fn counters_track_live_and_occupied() {
    let idx = fresh_index(128);
    for lblk in 0..10 {
        idx.insert(make_key(1, lblk).expect("key")).expect("insert");
    }
    assert_eq!(idx.size(), 10);
    assert_eq!(idx.occupied(), 10);

    idx.remove(make_key(1, 3).expect("key")).expect("remove");
    assert_eq!(idx.size(), 9);
    // The tombstone still occupies its slot.
    assert_eq!(idx.occupied(), 10);
}
