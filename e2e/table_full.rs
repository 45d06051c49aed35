//! E2E Suite 02: probe exhaustion and the table-full boundary.
//!
//! The probe modulus bounds every chain: once all `mod` addressable slots
//! hold live keys, a fresh insert has nowhere to go and must fail rather
//! than loop.

extern crate hashfs;

use hashfs::{make_key, HashChoice, HashIndex, IndexError, Region, Superblock};

const BLOCK: usize = 4096;

/// 16-slot table: the probe modulus is 13, the largest prime not above 16.
fn tiny_index() -> HashIndex {
    let region = Region::anonymous(4 * BLOCK).expect("region");
    HashIndex::new(region, &Superblock::new(0, 16), HashChoice::Direct).expect("format index")
}

#[test]
fn sixteen_slot_table_probes_mod_13() {
    let idx = tiny_index();
    assert_eq!(idx.num_entries(), 16);
    assert_eq!(idx.modulus(), 13);
}

#[test]
fn last_free_slot_is_still_usable() {
    let idx = tiny_index();
    // 12 of 13 addressable slots filled...
    for lblk in 0..12 {
        idx.insert(make_key(1, lblk).expect("key")).expect("insert");
    }
    // ...the 13th fresh key still lands.
    idx.insert(make_key(1, 12).expect("key"))
        .expect("last slot insert");
    assert_eq!(idx.size(), 13);
}

#[test]
fn insert_into_full_chain_returns_table_full() {
    let idx = tiny_index();
    // Fill every addressable slot; direct hashing maps lblk 0..13 to
    // buckets 0..12 one-to-one.
    for lblk in 0..13 {
        idx.insert(make_key(1, lblk).expect("key")).expect("insert");
    }

    // A fresh colliding key probes all 13 slots, finds 13 strangers.
    assert_eq!(
        idx.insert(make_key(2, 100).expect("key")),
        Err(IndexError::TableFull)
    );
}

#[test]
fn duplicate_detection_beats_table_full() {
    let idx = tiny_index();
    for lblk in 0..13 {
        idx.insert(make_key(1, lblk).expect("key")).expect("insert");
    }
    // Re-inserting a resident key of the saturated table reports Exists,
    // not TableFull.
    assert_eq!(
        idx.insert(make_key(1, 5).expect("key")),
        Err(IndexError::Exists)
    );
}

#[test]
fn tombstone_keeps_a_saturated_chain_usable() {
    let idx = tiny_index();
    for lblk in 0..13 {
        idx.insert(make_key(1, lblk).expect("key")).expect("insert");
    }
    let victim = make_key(1, 6).expect("key");
    let freed = idx.remove(victim).expect("remove").expect("was present");

    // The chain has no Empty slot left, but the tombstone is claimable.
    let fresh = make_key(3, 40).expect("key");
    assert_eq!(idx.insert(fresh).expect("insert"), freed);

    // And now the table is saturated again.
    assert_eq!(
        idx.insert(make_key(3, 41).expect("key")),
        Err(IndexError::TableFull)
    );
}

#[test]
fn lookup_and_remove_terminate_on_a_full_table() {
    let idx = tiny_index();
    for lblk in 0..13 {
        idx.insert(make_key(1, lblk).expect("key")).expect("insert");
    }
    // Probing a full table for an absent key walks all mod slots and stops.
    let absent = make_key(9, 90).expect("key");
    assert_eq!(idx.lookup(absent).expect("lookup"), None);
    assert_eq!(idx.remove(absent).expect("remove"), None);
}
