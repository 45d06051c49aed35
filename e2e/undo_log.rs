//! E2E Suite 04: undo-log transactions and crash recovery.
//!
//! The log and the allocator bitmap live in file-backed regions; "crashing"
//! is dropping every handle before commit and reopening from the paths.

extern crate hashfs;

use hashfs::undo::{EntryType, UndoEntry, ENTRY_UNIT};
use hashfs::{BlockBitmap, NoopTarget, Region, UndoLog, UndoLogError};
use std::path::Path;

const LOG_BYTES: usize = 256 * ENTRY_UNIT;

fn open_log(path: &Path) -> UndoLog {
    let _ = env_logger::builder().is_test(true).try_init();
    let region = Region::open(path, LOG_BYTES).expect("map log region");
    UndoLog::open(region, &mut NoopTarget).expect("open log")
}

fn open_bitmap(path: &Path, nblocks: u64) -> BlockBitmap {
    let region = Region::open(path, 4096).expect("map bitmap region");
    BlockBitmap::new(region, nblocks).expect("bitmap")
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario: balloc entry logged, crash before commit, recovery rolls back
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn crash_before_commit_restores_the_bitmap() {
    let log_file = tempfile::NamedTempFile::new().expect("tempfile");
    let bm_file = tempfile::NamedTempFile::new().expect("tempfile");

    {
        let log = open_log(log_file.path());
        let bitmap = open_bitmap(bm_file.path(), 128);

        log.start_tx().expect("start");
        let pre = bitmap.preimage_byte(17).expect("preimage");
        log.log_balloc(17, 1, pre).expect("log balloc");
        bitmap.reserve(17).expect("reserve");
        assert!(bitmap.is_set(17).expect("is_set"));
        // Crash: handles dropped, no commit written.
    }

    let mut bitmap = open_bitmap(bm_file.path(), 128);
    let log = {
        let region = Region::open(log_file.path(), LOG_BYTES).expect("map log region");
        UndoLog::open(region, &mut bitmap).expect("recover")
    };

    // The pre-image freed block 17 again; a synthetic commit sealed the log.
    assert!(!bitmap.is_set(17).expect("is_set"));
    let entries = log.sanity_check().expect("scan");
    assert_eq!(entries.last().expect("entries").1, UndoEntry::Commit);

    // The log now carries no live transaction.
    let region = log.close();
    let log = UndoLog::open(region, &mut bitmap).expect("clean reopen");
    log.start_tx().expect("fresh tx");
    log.commit_tx().expect("fresh commit");
}

#[test]
fn committed_transaction_is_not_rolled_back() {
    let log_file = tempfile::NamedTempFile::new().expect("tempfile");
    let bm_file = tempfile::NamedTempFile::new().expect("tempfile");

    {
        let log = open_log(log_file.path());
        let bitmap = open_bitmap(bm_file.path(), 128);
        log.start_tx().expect("start");
        let pre = bitmap.preimage_byte(9).expect("preimage");
        log.log_balloc(9, 1, pre).expect("log balloc");
        bitmap.reserve(9).expect("reserve");
        log.commit_tx().expect("commit");
    }

    let mut bitmap = open_bitmap(bm_file.path(), 128);
    let region = Region::open(log_file.path(), LOG_BYTES).expect("map log region");
    UndoLog::open(region, &mut bitmap).expect("reopen");
    // Commit stands: the allocation survives recovery.
    assert!(bitmap.is_set(9).expect("is_set"));
}

#[test]
fn rollback_applies_preimages_newest_first() {
    let log_file = tempfile::NamedTempFile::new().expect("tempfile");
    let bm_file = tempfile::NamedTempFile::new().expect("tempfile");

    {
        let log = open_log(log_file.path());
        let bitmap = open_bitmap(bm_file.path(), 128);
        log.start_tx().expect("start");
        // Two flips of the same bitmap byte: blocks 0 and 1 share byte 0.
        let pre0 = bitmap.preimage_byte(0).expect("preimage");
        log.log_balloc(0, 1, pre0).expect("log");
        bitmap.reserve(0).expect("reserve");
        let pre1 = bitmap.preimage_byte(1).expect("preimage");
        log.log_balloc(1, 1, pre1).expect("log");
        bitmap.reserve(1).expect("reserve");
    }

    let mut bitmap = open_bitmap(bm_file.path(), 128);
    let region = Region::open(log_file.path(), LOG_BYTES).expect("map log region");
    UndoLog::open(region, &mut bitmap).expect("recover");
    // Newest-first application ends on pre0, the fully clean byte.
    assert!(!bitmap.is_set(0).expect("is_set"));
    assert!(!bitmap.is_set(1).expect("is_set"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Entry visibility and log hygiene
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn scan_sees_only_fully_formed_entries() {
    let tmp = tempfile::NamedTempFile::new().expect("tempfile");
    let log = open_log(tmp.path());

    log.start_tx().expect("start");
    log.log_balloc(5, 2, 0x0F).expect("log");
    log.log_idx(8192, &[1, 2, 3, 4, 5]).expect("log idx");
    log.commit_tx().expect("commit");

    let entries: Vec<UndoEntry> = log
        .sanity_check()
        .expect("scan")
        .into_iter()
        .map(|(_, e)| e)
        .collect();
    assert_eq!(
        entries,
        vec![
            UndoEntry::Start,
            UndoEntry::Balloc {
                start_block: 5,
                nblk: 2,
                orig_val: 0x0F
            },
            UndoEntry::Idx {
                dev_byte_offset: 8192,
                original: vec![1, 2, 3, 4, 5]
            },
            UndoEntry::Commit,
        ]
    );
}

#[test]
fn truncate_resets_to_an_empty_log() {
    let tmp = tempfile::NamedTempFile::new().expect("tempfile");
    let log = open_log(tmp.path());
    log.start_tx().expect("start");
    log.log_balloc(1, 1, 0).expect("log");
    log.commit_tx().expect("commit");
    assert!(log.tail() > 0);

    log.truncate().expect("truncate");
    assert_eq!(log.tail(), 0);
    assert!(log.sanity_check().expect("scan").is_empty());

    // Truncation survives a restart.
    let region = log.close();
    drop(region);
    let log = open_log(tmp.path());
    assert_eq!(log.tail(), 0);
}

#[test]
fn transaction_flag_is_exclusive() {
    let tmp = tempfile::NamedTempFile::new().expect("tempfile");
    let log = open_log(tmp.path());
    log.start_tx().expect("start");
    assert!(matches!(log.start_tx(), Err(UndoLogError::TxAlreadyActive)));
    assert!(matches!(log.truncate(), Err(UndoLogError::TxAlreadyActive)));
    log.commit_tx().expect("commit");
    assert!(matches!(log.commit_tx(), Err(UndoLogError::TxNotActive)));
}

#[test]
fn lone_commit_aborts_the_open() {
    let tmp = tempfile::NamedTempFile::new().expect("tempfile");
    let region = Region::open(tmp.path(), LOG_BYTES).expect("map log region");
    region.write(0, &[EntryType::Commit as u8]).expect("plant commit");
    region.persist(0, 1).expect("persist");
    assert!(matches!(
        UndoLog::open(region, &mut NoopTarget),
        Err(UndoLogError::Inconsistent {
            nstart: 0,
            ncommit: 1
        })
    ));
}
