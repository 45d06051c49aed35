//! Composite key encoding and slot-state classification.
//!
//! A slot is a single 64-bit cell; its state lives entirely inside the value.
//! Two reserved sentinels mark the non-valid states:
//!
//! | value                   | state     |
//! |-------------------------|-----------|
//! | `0xFFFF_FFFF_FFFF_FFFF` | empty     |
//! | `0xFFFF_FFFF_FFFF_FFFE` | tombstone |
//! | anything else           | valid key |
//!
//! A valid key packs `(inum, lblk)` as `(inum << 32) | lblk`. The key domain
//! is restricted so the encoder can never produce a sentinel.

use crate::index::IndexError;
use crate::types::{Inum, LAddr};

/// Slot value meaning "never written since initialization".
pub const EMPTY: u64 = !0u64;

/// Slot value meaning "previously held a key, now deleted".
pub const TOMBSTONE: u64 = EMPTY - 1;

/// Returns `true` for either reserved sentinel.
#[inline]
pub fn is_sentinel(raw: u64) -> bool {
    raw >= TOMBSTONE
}

/// Returns `true` when `raw` encodes a live key.
#[inline]
pub fn is_valid(raw: u64) -> bool {
    raw < TOMBSTONE
}

/// Encode `(inum, lblk)` into a 64-bit composite key.
///
/// The pair `inum == u32::MAX` with `lblk >= u32::MAX - 1` is rejected: it
/// would collide with the sentinels. In practice all-ones is reserved as
/// "no inode" and an all-ones logical block number is an implausible file
/// size, so real callers never hit this.
#[inline]
pub fn make_key(inum: Inum, lblk: LAddr) -> Result<u64, IndexError> {
    let key = ((inum as u64) << 32) | lblk as u64;
    if is_sentinel(key) {
        return Err(IndexError::ReservedKey);
    }
    Ok(key)
}

/// High 32 bits of a composite key: the inode number.
#[inline]
pub fn key_inum(key: u64) -> Inum {
    (key >> 32) as u32
}

/// Low 32 bits of a composite key: the logical block.
#[inline]
pub fn key_lblk(key: u64) -> LAddr {
    key as u32
}

/// API-boundary view of one slot. The in-memory representation stays a bare
/// 64-bit atomic; this sum type only exists at classification points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Tombstone,
    Valid(u64),
}

impl SlotState {
    /// Classify a raw slot value.
    #[inline]
    pub fn from_raw(raw: u64) -> SlotState {
        match raw {
            EMPTY => SlotState::Empty,
            TOMBSTONE => SlotState::Tombstone,
            k => SlotState::Valid(k),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_disjoint_from_key_domain() {
        assert!(is_sentinel(EMPTY));
        assert!(is_sentinel(TOMBSTONE));
        assert!(!is_valid(EMPTY));
        assert!(!is_valid(TOMBSTONE));
        // Largest encodable key is one below the tombstone.
        assert!(is_valid(TOMBSTONE - 1));
    }

    #[test]
    fn make_key_round_trips() {
        let key = make_key(5, 77).unwrap();
        assert_eq!(key, (5u64 << 32) | 77);
        assert_eq!(key_inum(key), 5);
        assert_eq!(key_lblk(key), 77);
    }

    #[test]
    fn make_key_rejects_sentinel_domain() {
        assert_eq!(
            make_key(u32::MAX, u32::MAX),
            Err(IndexError::ReservedKey)
        );
        assert_eq!(
            make_key(u32::MAX, u32::MAX - 1),
            Err(IndexError::ReservedKey)
        );
        // The rest of the all-ones inode's blocks still encode fine.
        assert!(make_key(u32::MAX, u32::MAX - 2).is_ok());
    }

    #[test]
    fn zero_key_is_valid() {
        // inum 0 is the root inode; (0, 0) must be representable.
        let key = make_key(0, 0).unwrap();
        assert_eq!(SlotState::from_raw(key), SlotState::Valid(0));
    }

    #[test]
    fn slot_state_classification() {
        assert_eq!(SlotState::from_raw(EMPTY), SlotState::Empty);
        assert_eq!(SlotState::from_raw(TOMBSTONE), SlotState::Tombstone);
        assert_eq!(SlotState::from_raw(42), SlotState::Valid(42));
    }
}
