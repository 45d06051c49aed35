//! Probe engine: the deterministic slot-visit order for a key, plus the
//! prime/mask table parameters it depends on.
//!
//! The initial bucket is `seed % mod` where `mod` is the largest prime not
//! exceeding the slot count; a prime modulus keeps the distribution usable
//! even under the weaker hash functions. Probing then steps linearly by
//! default, or by a growing (triangular) step when the `quadratic-probe`
//! feature is selected, yielding `i0, i0+1, i0+3, i0+6, ...`.

use crate::config::QUADRATIC_PROBE;

/// Largest prime `p` with `p <= n`. `n` must be at least 2.
pub fn largest_prime_le(n: u32) -> u32 {
    debug_assert!(n >= 2);
    let mut cand = n;
    while cand >= 2 {
        if is_prime(cand) {
            return cand;
        }
        cand -= 1;
    }
    2
}

fn is_prime(n: u32) -> bool {
    if n < 4 {
        return n >= 2;
    }
    if n % 2 == 0 || n % 3 == 0 {
        return false;
    }
    // 6k +/- 1 trial division; sqrt(u32::MAX) < 65536 bounds the walk.
    let mut d = 5u32;
    while (d as u64) * (d as u64) <= n as u64 {
        if n % d == 0 || n % (d + 2) == 0 {
            return false;
        }
        d += 6;
    }
    true
}

/// Mask of the largest power of two not exceeding `n`, minus one.
/// Stored in the meta block for the triangular-step mode.
pub fn pow2_mask_below(n: u64) -> u32 {
    debug_assert!(n >= 1);
    let shift = 63 - n.leading_zeros();
    ((1u64 << shift) - 1) as u32
}

/// The slot-visit order for one key, bounded at `mod` steps.
///
/// Yields the initial bucket first. Exhausting the iterator without an
/// Empty slot or a match is the table-full condition.
#[derive(Debug, Clone)]
pub struct ProbeSeq {
    pos: u32,
    step: u32,
    modulus: u32,
    taken: u32,
}

impl ProbeSeq {
    /// Start a sequence from a 32-bit hash seed.
    pub fn new(seed: u32, modulus: u32) -> ProbeSeq {
        ProbeSeq {
            pos: seed % modulus,
            step: if QUADRATIC_PROBE { 0 } else { 1 },
            modulus,
            taken: 0,
        }
    }

    /// Continue a sequence from a slot yielded earlier, preserving the step
    /// state that was in force there (`step_state()` at yield time). Keeps a
    /// resumed triangular walk on the same chain as the original.
    pub fn resume_from(slot: u32, step_at_slot: u32, modulus: u32) -> ProbeSeq {
        ProbeSeq {
            pos: slot % modulus,
            step: if QUADRATIC_PROBE {
                step_at_slot.saturating_sub(1)
            } else {
                1
            },
            modulus,
            taken: 0,
        }
    }

    /// Number of slots yielded so far.
    #[inline]
    pub fn steps(&self) -> u32 {
        self.taken
    }

    /// Step counter after the most recent yield; pass to [`ProbeSeq::resume_from`].
    #[inline]
    pub fn step_state(&self) -> u32 {
        self.step
    }
}

impl Iterator for ProbeSeq {
    type Item = u32;

    #[inline]
    fn next(&mut self) -> Option<u32> {
        if self.taken >= self.modulus {
            return None;
        }
        let cur = self.pos;
        self.taken += 1;
        if QUADRATIC_PROBE {
            self.step += 1;
            self.pos = (self.pos + self.step) % self.modulus;
        } else {
            self.pos = (self.pos + 1) % self.modulus;
        }
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn largest_prime_values() {
        assert_eq!(largest_prime_le(2), 2);
        assert_eq!(largest_prime_le(3), 3);
        assert_eq!(largest_prime_le(16), 13);
        assert_eq!(largest_prime_le(127), 127);
        assert_eq!(largest_prime_le(128), 127);
        assert_eq!(largest_prime_le(4096), 4093);
        assert_eq!(largest_prime_le(65536), 65521);
    }

    #[test]
    fn pow2_mask_values() {
        assert_eq!(pow2_mask_below(8), 7);
        assert_eq!(pow2_mask_below(9), 7);
        assert_eq!(pow2_mask_below(16), 15);
        assert_eq!(pow2_mask_below(4093), 2047);
    }

    #[cfg(not(feature = "quadratic-probe"))]
    #[test]
    fn linear_sequence_wraps_at_modulus() {
        let seq: Vec<u32> = ProbeSeq::new(125, 127).take(5).collect();
        assert_eq!(seq, vec![125, 126, 0, 1, 2]);
    }

    #[cfg(feature = "quadratic-probe")]
    #[test]
    fn triangular_sequence_offsets() {
        let seq: Vec<u32> = ProbeSeq::new(0, 127).take(5).collect();
        assert_eq!(seq, vec![0, 1, 3, 6, 10]);
    }

    #[test]
    fn sequence_is_bounded_by_modulus() {
        assert_eq!(ProbeSeq::new(42, 13).count(), 13);
    }

    #[test]
    fn resumed_sequence_stays_on_the_original_chain() {
        let mut orig = ProbeSeq::new(0, 127);
        let mut visited = Vec::new();
        let mut resume_state = (0u32, 0u32);
        for _ in 0..3 {
            let idx = orig.next().unwrap();
            visited.push(idx);
            resume_state = (idx, orig.step_state());
        }
        // Resuming from the third yield must replay it and then continue
        // exactly where the original walk goes next.
        let mut resumed = ProbeSeq::resume_from(resume_state.0, resume_state.1, 127);
        assert_eq!(resumed.next(), Some(visited[2]));
        assert_eq!(resumed.next(), orig.next());
        assert_eq!(resumed.next(), orig.next());
    }

    #[cfg(not(feature = "quadratic-probe"))]
    #[test]
    fn linear_sequence_visits_every_slot_once() {
        let mut seen = vec![false; 13];
        for idx in ProbeSeq::new(7, 13) {
            assert!(!seen[idx as usize], "slot {} visited twice", idx);
            seen[idx as usize] = true;
        }
        assert!(seen.iter().all(|&v| v));
    }
}
