//! E2E Suite 05: concurrent inserts and lookups.
//!
//! The index is shared by reference across OS threads; slot claiming is a
//! CAS race and these tests drive it hard enough to hit real contention.

extern crate hashfs;

use crossbeam_channel::unbounded;
use hashfs::{make_key, HashChoice, HashIndex, Region, Superblock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const BLOCK: usize = 4096;

fn big_index(ndatablocks: u64, hash: HashChoice) -> HashIndex {
    let bytes = BLOCK + ndatablocks as usize * 8;
    let region = Region::anonymous(bytes).expect("region");
    HashIndex::new(region, &Superblock::new(0, ndatablocks), hash).expect("format index")
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario: N threads, disjoint key sets
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn disjoint_inserts_from_eight_threads_all_land() {
    const NTHREADS: u32 = 8;
    const PER_THREAD: u32 = 10_000;

    let idx = big_index(131_072, HashChoice::Murmur64);
    let (tx, rx) = unbounded::<(u64, u64)>();

    std::thread::scope(|s| {
        for tid in 0..NTHREADS {
            let idx = &idx;
            let tx = tx.clone();
            s.spawn(move || {
                for lblk in 0..PER_THREAD {
                    let key = make_key(tid, lblk).expect("key");
                    let pblk = idx.insert(key).expect("insert");
                    tx.send((key, pblk)).expect("send");
                }
            });
        }
        drop(tx);
    });

    let mut seen_slots = HashSet::new();
    let mut count = 0u32;
    for (key, pblk) in rx.iter() {
        // Every insert's slot is unique across all threads.
        assert!(seen_slots.insert(pblk), "slot {} handed out twice", pblk);
        // And still resolves after the dust settles.
        assert_eq!(idx.lookup(key).expect("lookup"), Some(pblk));
        count += 1;
    }
    assert_eq!(count, NTHREADS * PER_THREAD);
    assert_eq!(idx.size(), NTHREADS * PER_THREAD);
}

// ─────────────────────────────────────────────────────────────────────────────
// Racing inserts of the SAME key: exactly one winner
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn same_key_race_has_exactly_one_winner() {
    const NTHREADS: usize = 8;
    const ROUNDS: u32 = 500;

    let idx = big_index(4096, HashChoice::Murmur64);

    for round in 0..ROUNDS {
        let key = make_key(77, round).expect("key");
        let wins = AtomicU64::new(0);

        std::thread::scope(|s| {
            for _ in 0..NTHREADS {
                let idx = &idx;
                let wins = &wins;
                s.spawn(move || {
                    if idx.insert(key).is_ok() {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });

        assert_eq!(wins.load(Ordering::Relaxed), 1, "round {}", round);
        assert!(idx.lookup(key).expect("lookup").is_some());
    }
    assert_eq!(idx.size(), ROUNDS);
}

// ─────────────────────────────────────────────────────────────────────────────
// One inserter, many readers: lookups never observe a torn slot
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn readers_see_a_consistent_slot_for_a_key_being_inserted() {
    const NREADERS: usize = 4;

    let idx = big_index(4096, HashChoice::Murmur64);
    let key = make_key(1, 1).expect("key");
    let done = AtomicBool::new(false);
    let expected = AtomicU64::new(0);

    std::thread::scope(|s| {
        for _ in 0..NREADERS {
            let idx = &idx;
            let done = &done;
            let expected = &expected;
            s.spawn(move || {
                while !done.load(Ordering::Acquire) {
                    if let Some(pblk) = idx.lookup(key).expect("lookup") {
                        // Any successful lookup returns the winner's slot,
                        // never a tombstone or a half-written value.
                        let want = expected.load(Ordering::Acquire);
                        if want != 0 {
                            assert_eq!(pblk, want);
                        }
                    }
                }
            });
        }

        // Give the readers a moment on the absent key, then insert.
        std::thread::yield_now();
        let pblk = idx.insert(key).expect("insert");
        expected.store(pblk, Ordering::Release);
        // Let the readers chew on the present key before stopping them.
        for _ in 0..10_000 {
            assert_eq!(idx.lookup(key).expect("lookup"), Some(pblk));
        }
        done.store(true, Ordering::Release);
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Concurrent remove + insert on one chain keeps the chain sound
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn chain_stays_sound_under_remove_insert_churn() {
    const NTHREADS: u32 = 4;
    const PER_THREAD: u32 = 500;

    let idx = big_index(8192, HashChoice::Murmur64);

    // Pre-populate one key per thread.
    for tid in 0..NTHREADS {
        idx.insert(make_key(tid, 0).expect("key")).expect("insert");
    }

    // Each thread churns its own key: remove, reinsert, lookup.
    std::thread::scope(|s| {
        for tid in 0..NTHREADS {
            let idx = &idx;
            s.spawn(move || {
                let key = make_key(tid, 0).expect("key");
                for _ in 0..PER_THREAD {
                    assert!(idx.remove(key).expect("remove").is_some());
                    idx.insert(key).expect("reinsert");
                    assert!(idx.lookup(key).expect("lookup").is_some());
                }
            });
        }
    });

    for tid in 0..NTHREADS {
        assert!(idx
            .lookup(make_key(tid, 0).expect("key"))
            .expect("lookup")
            .is_some());
    }
    assert_eq!(idx.size(), NTHREADS);
}
