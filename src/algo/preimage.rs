//! Canonical 64-byte preimage and per-algorithm midstates.
//!
//! The preimage commits to the contract's current location and to the
//! miner's own input/output scripts:
//!
//! ```text
//! preimage[0..32]  = SHA-256( reverse(location_txid) || contract_ref )
//! preimage[32..64] = SHA-256( SHA-256d(input_script) || SHA-256d(output_script) )
//! ```
//!
//! The search appends an 8-byte little-endian nonce to form the 72-byte
//! hash input.

use sha2::{Digest, Sha256};

use super::Algorithm;

pub const PREIMAGE_LEN: usize = 64;
pub const HASH_INPUT_LEN: usize = 72;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// Two successive SHA-256 passes.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// Build the canonical preimage. `txid_le` and `contract_ref_le` are the
/// byte-reversed forms carried by `Work`.
pub fn build(
    txid_le: &[u8; 32],
    contract_ref_le: &[u8; 36],
    input_script: &[u8],
    output_script: &[u8],
) -> [u8; 64] {
    let mut first = Vec::with_capacity(68);
    first.extend_from_slice(txid_le);
    first.extend_from_slice(contract_ref_le);

    let mut second = Vec::with_capacity(64);
    second.extend_from_slice(&sha256d(input_script));
    second.extend_from_slice(&sha256d(output_script));

    let mut preimage = [0u8; 64];
    preimage[..32].copy_from_slice(&sha256(&first));
    preimage[32..].copy_from_slice(&sha256(&second));
    preimage
}

/// The 72-byte hash input for a candidate nonce.
pub fn hash_input(preimage: &[u8; 64], nonce: u64) -> [u8; 72] {
    let mut input = [0u8; 72];
    input[..64].copy_from_slice(preimage);
    input[64..].copy_from_slice(&nonce.to_le_bytes());
    input
}

/// Algorithm-specific precomputation over the fixed preimage prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Midstate {
    /// SHA-256 compression state after absorbing the preimage as block one.
    Sha256([u32; 8]),
    /// The raw preimage as 16 little-endian u32 words; the device runs the
    /// first compression itself.
    Words([u32; 16]),
    /// Raw preimage, no precomputation.
    Raw([u8; 64]),
}

impl Midstate {
    pub fn for_algorithm(algo: Algorithm, preimage: &[u8; 64]) -> Self {
        match algo {
            Algorithm::Sha256d => {
                let mut state = SHA256_IV;
                sha256_compress(&mut state, preimage);
                Midstate::Sha256(state)
            }
            Algorithm::Blake3 | Algorithm::K12 => {
                let mut words = [0u32; 16];
                for (i, chunk) in preimage.chunks_exact(4).enumerate() {
                    words[i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }
                Midstate::Words(words)
            }
            Algorithm::Argon2Light => Midstate::Raw(*preimage),
        }
    }

    /// Layout written into the device midstate buffer.
    pub fn device_words(&self) -> Vec<u32> {
        match self {
            Midstate::Sha256(state) => state.to_vec(),
            Midstate::Words(words) => words.to_vec(),
            Midstate::Raw(bytes) => bytes
                .chunks_exact(4)
                .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
        }
    }
}

pub const SHA256_IV: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab,
    0x5be0cd19,
];

const SHA256_K: [u32; 64] = [
    0x428a2f98, 0x71374491, 0xb5c0fbcf, 0xe9b5dba5, 0x3956c25b, 0x59f111f1, 0x923f82a4,
    0xab1c5ed5, 0xd807aa98, 0x12835b01, 0x243185be, 0x550c7dc3, 0x72be5d74, 0x80deb1fe,
    0x9bdc06a7, 0xc19bf174, 0xe49b69c1, 0xefbe4786, 0x0fc19dc6, 0x240ca1cc, 0x2de92c6f,
    0x4a7484aa, 0x5cb0a9dc, 0x76f988da, 0x983e5152, 0xa831c66d, 0xb00327c8, 0xbf597fc7,
    0xc6e00bf3, 0xd5a79147, 0x06ca6351, 0x14292967, 0x27b70a85, 0x2e1b2138, 0x4d2c6dfc,
    0x53380d13, 0x650a7354, 0x766a0abb, 0x81c2c92e, 0x92722c85, 0xa2bfe8a1, 0xa81a664b,
    0xc24b8b70, 0xc76c51a3, 0xd192e819, 0xd6990624, 0xf40e3585, 0x106aa070, 0x19a4c116,
    0x1e376c08, 0x2748774c, 0x34b0bcb5, 0x391c0cb3, 0x4ed8aa4a, 0x5b9cca4f, 0x682e6ff3,
    0x748f82ee, 0x78a5636f, 0x84c87814, 0x8cc70208, 0x90befffa, 0xa4506ceb, 0xbef9a3f7,
    0xc67178f2,
];

/// One SHA-256 compression round over a 64-byte block.
pub fn sha256_compress(state: &mut [u32; 8], block: &[u8; 64]) {
    let mut w = [0u32; 64];
    for (i, chunk) in block.chunks_exact(4).enumerate() {
        w[i] = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    for i in 16..64 {
        let s0 = w[i - 15].rotate_right(7) ^ w[i - 15].rotate_right(18) ^ (w[i - 15] >> 3);
        let s1 = w[i - 2].rotate_right(17) ^ w[i - 2].rotate_right(19) ^ (w[i - 2] >> 10);
        w[i] = w[i - 16]
            .wrapping_add(s0)
            .wrapping_add(w[i - 7])
            .wrapping_add(s1);
    }

    let [mut a, mut b, mut c, mut d, mut e, mut f, mut g, mut h] = *state;
    for i in 0..64 {
        let s1 = e.rotate_right(6) ^ e.rotate_right(11) ^ e.rotate_right(25);
        let ch = (e & f) ^ (!e & g);
        let t1 = h
            .wrapping_add(s1)
            .wrapping_add(ch)
            .wrapping_add(SHA256_K[i])
            .wrapping_add(w[i]);
        let s0 = a.rotate_right(2) ^ a.rotate_right(13) ^ a.rotate_right(22);
        let maj = (a & b) ^ (a & c) ^ (b & c);
        let t2 = s0.wrapping_add(maj);
        h = g;
        g = f;
        f = e;
        e = d.wrapping_add(t1);
        d = c;
        c = b;
        b = a;
        a = t1.wrapping_add(t2);
    }

    state[0] = state[0].wrapping_add(a);
    state[1] = state[1].wrapping_add(b);
    state[2] = state[2].wrapping_add(c);
    state[3] = state[3].wrapping_add(d);
    state[4] = state[4].wrapping_add(e);
    state[5] = state[5].wrapping_add(f);
    state[6] = state[6].wrapping_add(g);
    state[7] = state[7].wrapping_add(h);
}

/// Finish SHA-256d over the 72-byte input given the block-one midstate,
/// hashing only the second (nonce + padding) block. This is the exact
/// computation the sha256d kernel performs.
pub fn sha256d_from_midstate(midstate: &[u32; 8], nonce: u64) -> [u8; 32] {
    // Second block: 8 nonce bytes, 0x80, zero pad, 64-bit length (576 bits).
    let mut block = [0u8; 64];
    block[..8].copy_from_slice(&nonce.to_le_bytes());
    block[8] = 0x80;
    block[56..].copy_from_slice(&(HASH_INPUT_LEN as u64 * 8).to_be_bytes());

    let mut state = *midstate;
    sha256_compress(&mut state, &block);

    let mut first = [0u8; 32];
    for (i, word) in state.iter().enumerate() {
        first[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
    }
    sha256(&first)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_preimage() -> [u8; 64] {
        let mut preimage = [0u8; 64];
        for (i, byte) in preimage.iter_mut().enumerate() {
            *byte = i as u8;
        }
        preimage
    }

    #[test]
    fn test_compress_matches_sha2_one_block() {
        // A 64-byte message: midstate + explicit padding block must equal
        // the library digest.
        let msg = sample_preimage();
        let mut state = SHA256_IV;
        sha256_compress(&mut state, &msg);

        let mut pad = [0u8; 64];
        pad[0] = 0x80;
        pad[56..].copy_from_slice(&(64u64 * 8).to_be_bytes());
        sha256_compress(&mut state, &pad);

        let mut manual = [0u8; 32];
        for (i, word) in state.iter().enumerate() {
            manual[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        assert_eq!(manual, sha256(&msg));
    }

    #[test]
    fn test_midstate_finalize_matches_full_hash() {
        let preimage = sample_preimage();
        let midstate = match Midstate::for_algorithm(Algorithm::Sha256d, &preimage) {
            Midstate::Sha256(state) => state,
            other => panic!("unexpected midstate {:?}", other),
        };

        for nonce in [0u64, 1, 0xdead_beef, u64::MAX] {
            let from_midstate = sha256d_from_midstate(&midstate, nonce);
            let full = sha256d(&hash_input(&preimage, nonce));
            assert_eq!(from_midstate, full, "nonce {}", nonce);
        }
    }

    #[test]
    fn test_word_midstate_layout() {
        let preimage = sample_preimage();
        let midstate = Midstate::for_algorithm(Algorithm::Blake3, &preimage);
        let words = midstate.device_words();
        assert_eq!(words.len(), 16);
        assert_eq!(words[0], u32::from_le_bytes([0, 1, 2, 3]));
        assert_eq!(words[15], u32::from_le_bytes([60, 61, 62, 63]));
    }

    #[test]
    fn test_preimage_commits_to_both_scripts() {
        let txid = [7u8; 32];
        let contract_ref = [9u8; 36];
        let a = build(&txid, &contract_ref, b"input-a", b"output");
        let b = build(&txid, &contract_ref, b"input-b", b"output");
        let c = build(&txid, &contract_ref, b"input-a", b"other");
        assert_ne!(a, b);
        assert_ne!(a, c);
        // First half only depends on location and ref.
        assert_eq!(a[..32], b[..32]);
    }
}
