//! Hash functions mapping a 64-bit composite key to a 32-bit probe seed.
//!
//! All functions share one contract: pure, deterministic, full-key input,
//! 32-bit output. The probe engine reduces the seed modulo the table's prime.
//! [`mix8`] is the 8-lane variant of [`mix`] used by the batched lookup path;
//! it is written lane-wise so targets without wide SIMD get identical results
//! from straight-line code.

use xxhash_rust::xxh32::xxh32;

const MURMUR_C1: u64 = 0xff51_afd7_ed55_8ccd;
const MURMUR_C2: u64 = 0xc4ce_b9fe_1a85_ec53;

/// Available hash functions; the index is constructed with one and the
/// choice is fixed for the lifetime of the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashChoice {
    /// Low 32 bits of the key. Adequate because the probe modulus is prime.
    #[default]
    Direct,
    /// XOR of the key's two halves.
    Combo,
    /// 9-round subtract/xor/shift mixer.
    Mix,
    /// Murmur3 64-bit finalizer, truncated.
    Murmur64,
    /// 32-bit xxHash over the key's 8 little-endian bytes.
    XxHash32,
    /// Multiply/xor scrambler.
    Scramble64,
}

impl HashChoice {
    /// Apply the selected function.
    #[inline]
    pub fn seed(self, key: u64) -> u32 {
        match self {
            HashChoice::Direct => direct_hash(key),
            HashChoice::Combo => combo_hash(key),
            HashChoice::Mix => mix(key),
            HashChoice::Murmur64 => murmur64(key),
            HashChoice::XxHash32 => xxhash32(key),
            HashChoice::Scramble64 => scramble64(key),
        }
    }
}

/// Identity on the low 32 bits.
#[inline]
pub fn direct_hash(key: u64) -> u32 {
    key as u32
}

/// XOR-fold the two 32-bit halves.
#[inline]
pub fn combo_hash(key: u64) -> u32 {
    (key as u32) ^ ((key >> 32) as u32)
}

/// 9-round subtract/xor/shift mixer seeded with the two Murmur constants.
#[inline]
pub fn mix(key: u64) -> u32 {
    let mut a = MURMUR_C1;
    let mut b = MURMUR_C2;
    let mut c = key;

    a = a.wrapping_sub(b).wrapping_sub(c) ^ (c >> 13);
    b = b.wrapping_sub(c).wrapping_sub(a) ^ (a << 8);
    c = c.wrapping_sub(a).wrapping_sub(b) ^ (b >> 13);
    a = a.wrapping_sub(b).wrapping_sub(c) ^ (c >> 12);
    b = b.wrapping_sub(c).wrapping_sub(a) ^ (a << 16);
    c = c.wrapping_sub(a).wrapping_sub(b) ^ (b >> 5);
    a = a.wrapping_sub(b).wrapping_sub(c) ^ (c >> 3);
    b = b.wrapping_sub(c).wrapping_sub(a) ^ (a << 10);
    c = c.wrapping_sub(a).wrapping_sub(b) ^ (b >> 15);

    c as u32
}

/// Standard two-multiply Murmur3 finalizer, truncated to 32 bits.
#[inline]
pub fn murmur64(key: u64) -> u32 {
    let mut h = key;
    h ^= h >> 33;
    h = h.wrapping_mul(MURMUR_C1);
    h ^= h >> 33;
    h = h.wrapping_mul(MURMUR_C2);
    h ^= h >> 33;
    h as u32
}

/// XXH32 over the key's 8 little-endian bytes, seed 0.
#[inline]
pub fn xxhash32(key: u64) -> u32 {
    xxh32(&key.to_le_bytes(), 0)
}

/// Multiply/xor scrambler.
#[inline]
pub fn scramble64(key: u64) -> u32 {
    let mut x = key;
    x = x.wrapping_mul(0x8c98_cab1_667e_d515);
    x ^= x >> 57;
    x ^= x >> 21;
    x ^= 0xac27_4618_482b_6398;
    x ^= x >> 3;
    x = x.wrapping_mul(0x6908_cb6a_c8ce_9a09);
    x as u32
}

// ─────────────────────────────────────────────────────────────────────────────
// 8-lane batch variant
// ─────────────────────────────────────────────────────────────────────────────

/// [`mix`] applied to eight keys at once.
#[inline]
pub fn mix8(keys: &[u64; 8]) -> [u32; 8] {
    let mut out = [0u32; 8];
    for (o, &k) in out.iter_mut().zip(keys.iter()) {
        *o = mix(k);
    }
    out
}

/// Reduce eight seeds modulo the table prime, yielding initial buckets.
#[inline]
pub fn mod8(seeds: &[u32; 8], modulus: u32) -> [u32; 8] {
    let mut out = [0u32; 8];
    for (o, &s) in out.iter_mut().zip(seeds.iter()) {
        *o = s % modulus;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_takes_low_bits() {
        assert_eq!(direct_hash(0xAAAA_BBBB_1234_5678), 0x1234_5678);
    }

    #[test]
    fn combo_folds_halves() {
        assert_eq!(combo_hash(0x0000_0005_0000_0005), 0);
        assert_eq!(combo_hash((5u64 << 32) | 7), 5 ^ 7);
    }

    #[test]
    fn mixers_are_deterministic() {
        for f in [mix, murmur64, xxhash32, scramble64] {
            assert_eq!(f(0xdead_beef), f(0xdead_beef));
        }
    }

    #[test]
    fn mixers_spread_adjacent_keys() {
        // Adjacent composite keys should land in different buckets for any of
        // the mixing functions (direct/combo intentionally do not mix).
        let a = (1u64 << 32) | 0;
        let b = (1u64 << 32) | 1;
        assert_ne!(mix(a), mix(b));
        assert_ne!(murmur64(a), murmur64(b));
        assert_ne!(scramble64(a), scramble64(b));
        assert_ne!(xxhash32(a), xxhash32(b));
    }

    #[test]
    fn murmur_finalizer_known_vector() {
        // Finalizer of 0 is 0 by construction (all-zero input stays zero).
        assert_eq!(murmur64(0), 0);
        assert_ne!(murmur64(1), 1);
    }

    #[test]
    fn mix8_matches_scalar() {
        let keys = [0u64, 1, 2, 0xffff_fffd, 1 << 32, (7 << 32) | 3, 99, 1_000_000];
        let lanes = mix8(&keys);
        for (i, &k) in keys.iter().enumerate() {
            assert_eq!(lanes[i], mix(k));
        }
        let buckets = mod8(&lanes, 127);
        for (i, &s) in lanes.iter().enumerate() {
            assert_eq!(buckets[i], s % 127);
        }
    }

    #[test]
    fn choice_dispatch_matches_free_functions() {
        let k = 0x0102_0304_0506_0708u64;
        assert_eq!(HashChoice::Direct.seed(k), direct_hash(k));
        assert_eq!(HashChoice::Combo.seed(k), combo_hash(k));
        assert_eq!(HashChoice::Mix.seed(k), mix(k));
        assert_eq!(HashChoice::Murmur64.seed(k), murmur64(k));
        assert_eq!(HashChoice::XxHash32.seed(k), xxhash32(k));
        assert_eq!(HashChoice::Scramble64.seed(k), scramble64(k));
    }
}
