//! Host-side candidate verification.
//!
//! The device predicate is a filter, not an authority: every candidate the
//! driver surfaces is recomputed here before it may reach the coordinator.
//! A candidate that fails is a device false positive and is dropped
//! silently.

use tiny_keccak::{Hasher, KangarooTwelve};

use super::preimage::{hash_input, sha256d};
use super::{Algorithm, Target};

/// Hash the 72-byte input under `algo`. `None` for algorithms whose
/// hashing is not yet frozen.
pub fn hash_candidate(algo: Algorithm, input: &[u8; 72]) -> Option<[u8; 32]> {
    match algo {
        Algorithm::Sha256d => Some(sha256d(input)),
        Algorithm::Blake3 => Some(*blake3::hash(input).as_bytes()),
        Algorithm::K12 => {
            let mut k12 = KangarooTwelve::new(b"");
            k12.update(input);
            let mut out = [0u8; 32];
            k12.finalize(&mut out);
            Some(out)
        }
        Algorithm::Argon2Light => None,
    }
}

/// `LegacyV1` predicate: four zero bytes, then bytes 4..12 as a big-endian
/// u64 strictly below the target.
pub fn meets_legacy(hash: &[u8; 32], target: u64) -> bool {
    if hash[..4] != [0, 0, 0, 0] {
        return false;
    }
    let word = u64::from_be_bytes([
        hash[4], hash[5], hash[6], hash[7], hash[8], hash[9], hash[10], hash[11],
    ]);
    word < target
}

/// `Full256` predicate: whole hash strictly below the target, big-endian.
pub fn meets_full(hash: &[u8; 32], target: &[u8; 32]) -> bool {
    hash < target
}

/// Recompute the hash for `nonce` and test it against `target`.
pub fn verify(algo: Algorithm, preimage: &[u8; 64], nonce: u64, target: &Target) -> bool {
    let input = hash_input(preimage, nonce);
    let Some(hash) = hash_candidate(algo, &input) else {
        return false;
    };
    match target {
        Target::Legacy(t) => meets_legacy(&hash, *t),
        Target::Full(t) => meets_full(&hash, t),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::TargetFormat;

    #[test]
    fn test_legacy_requires_zero_prefix() {
        let mut hash = [0u8; 32];
        hash[4] = 0x01;
        assert!(meets_legacy(&hash, u64::MAX));

        hash[3] = 0x01;
        assert!(!meets_legacy(&hash, u64::MAX), "nonzero prefix must fail");
    }

    #[test]
    fn test_legacy_compares_bytes_4_to_12_big_endian() {
        let mut hash = [0u8; 32];
        hash[4..12].copy_from_slice(&0x0000_0FFF_FFFF_FFFEu64.to_be_bytes());
        assert!(meets_legacy(&hash, 0x0000_0FFF_FFFF_FFFF));
        // Equal is not below.
        hash[4..12].copy_from_slice(&0x0000_0FFF_FFFF_FFFFu64.to_be_bytes());
        assert!(!meets_legacy(&hash, 0x0000_0FFF_FFFF_FFFF));
        // Bytes past 12 are ignored.
        hash[4..12].copy_from_slice(&1u64.to_be_bytes());
        hash[12..].fill(0xFF);
        assert!(meets_legacy(&hash, 2));
    }

    #[test]
    fn test_full_is_lexicographic_big_endian() {
        let mut target = [0u8; 32];
        target[0] = 0x10;
        let mut hash = [0xFFu8; 32];
        hash[0] = 0x0F;
        assert!(meets_full(&hash, &target));
        hash[0] = 0x10;
        assert!(!meets_full(&hash, &target));
    }

    #[test]
    fn test_verify_accepts_under_max_full_target() {
        let preimage = [0x5au8; 64];
        let target = Target::Full([0xFF; 32]);
        // All-0xFF hashes are the only rejects; these nonces will not
        // produce one.
        for algo in [Algorithm::Blake3, Algorithm::K12] {
            assert!(verify(algo, &preimage, 0, &target), "{:?}", algo);
            assert!(verify(algo, &preimage, 12345, &target), "{:?}", algo);
        }
    }

    #[test]
    fn test_verify_matches_hash_candidate() {
        let preimage = [0x11u8; 64];
        let nonce = 42u64;
        let input = hash_input(&preimage, nonce);
        let hash = hash_candidate(Algorithm::Blake3, &input).unwrap();

        // A target one above the hash accepts; the hash itself rejects.
        let mut above = hash;
        let mut carried = true;
        for byte in above.iter_mut().rev() {
            if carried {
                let (next, overflow) = byte.overflowing_add(1);
                *byte = next;
                carried = overflow;
            }
        }
        assert!(!carried, "hash of all 0xFF bytes is vanishingly unlikely");
        assert!(verify(Algorithm::Blake3, &preimage, nonce, &Target::Full(above)));
        assert!(!verify(Algorithm::Blake3, &preimage, nonce, &Target::Full(hash)));
    }

    #[test]
    fn test_verify_refuses_argon2() {
        let preimage = [0u8; 64];
        let target = Target::from_difficulty(TargetFormat::Full256, 1);
        assert!(!verify(Algorithm::Argon2Light, &preimage, 0, &target));
    }

    #[test]
    fn test_algorithms_disagree() {
        // Distinct families over identical input; identical digests would
        // mean a dispatch bug.
        let preimage = [0x77u8; 64];
        let input = hash_input(&preimage, 7);
        let sha = hash_candidate(Algorithm::Sha256d, &input).unwrap();
        let blake = hash_candidate(Algorithm::Blake3, &input).unwrap();
        let k12 = hash_candidate(Algorithm::K12, &input).unwrap();
        assert_ne!(sha, blake);
        assert_ne!(blake, k12);
        assert_ne!(sha, k12);
    }
}
