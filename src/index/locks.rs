//! Optional per-slot reader-writer locking.
//!
//! The default build is lock-free: slot ownership is settled by CAS and this
//! module compiles to nothing. With the `slot-locks` feature the volatile
//! handle carries one `RwLock` per slot; lookups take read locks and
//! inserts/removes take write locks on each slot they visit.

#[cfg(feature = "slot-locks")]
mod imp {
    use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

    pub struct SlotLocks {
        locks: Vec<RwLock<()>>,
    }

    impl SlotLocks {
        pub fn new(nslots: usize) -> SlotLocks {
            let mut locks = Vec::with_capacity(nslots);
            locks.resize_with(nslots, || RwLock::new(()));
            SlotLocks { locks }
        }

        #[inline]
        pub fn read(&self, slot: u32) -> RwLockReadGuard<'_, ()> {
            // A poisoned slot lock carries no data to corrupt; take it anyway.
            match self.locks[slot as usize].read() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            }
        }

        #[inline]
        pub fn write(&self, slot: u32) -> RwLockWriteGuard<'_, ()> {
            match self.locks[slot as usize].write() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            }
        }
    }
}

#[cfg(not(feature = "slot-locks"))]
mod imp {
    /// Zero-sized stand-in; the CAS protocol alone orders slot writes.
    pub struct SlotLocks;

    /// Guard with no effect; exists so call sites read identically in both
    /// builds.
    pub struct NoGuard;

    impl SlotLocks {
        #[inline]
        pub fn new(_nslots: usize) -> SlotLocks {
            SlotLocks
        }

        #[inline]
        pub fn read(&self, _slot: u32) -> NoGuard {
            NoGuard
        }

        #[inline]
        pub fn write(&self, _slot: u32) -> NoGuard {
            NoGuard
        }
    }
}

pub use imp::SlotLocks;

#[cfg(not(feature = "slot-locks"))]
pub use imp::NoGuard;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_are_reentrant_across_slots() {
        let locks = SlotLocks::new(8);
        let _a = locks.read(0);
        let _b = locks.read(1);
        let _c = locks.write(2);
    }
}
