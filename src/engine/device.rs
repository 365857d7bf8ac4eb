//! The data-parallel search device.
//!
//! A device owns four buffers: `midstate` and `target` (rewritten on work
//! changes), a `nonce_offset` word and a `results` buffer of an atomic
//! counter plus fixed slots, reset each dispatch. The CPU backend below
//! runs the same per-thread predicate the kernels implement, so driver and
//! tests exercise one contract.

use rayon::prelude::*;

use crate::algo::preimage::{hash_input, sha256d_from_midstate};
use crate::algo::{verify, Algorithm};
use crate::error::MinerError;

/// Result slot capacity of the results buffer.
pub const RESULT_SLOTS: usize = 128;

/// Slots the driver reads back per dispatch.
pub const SLOTS_READ: usize = 2;

/// One appended result: `(nonce_lo, hash_w0, hash_w1, flag)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultSlot {
    pub nonce_lo: u32,
    pub hash_w0: u32,
    pub hash_w1: u32,
    pub flag: u32,
}

pub trait SearchDevice: Send {
    /// Rewrite the midstate and target buffers for a new work
    /// configuration.
    fn configure(
        &mut self,
        algo: Algorithm,
        midstate_words: &[u32],
        target_words: &[u32],
    ) -> Result<(), MinerError>;

    /// Threads covered by one dispatch (workgroups x workgroup size).
    fn dispatch_size(&self) -> u32;

    /// Reset the result counter, write `nonce_offset`, run one dispatch of
    /// `dispatch_size()` threads under the fixed `nonce_hi`, and read back
    /// at most `SLOTS_READ` filled slots.
    fn dispatch(&mut self, nonce_hi: u32, nonce_offset: u32) -> Result<Vec<ResultSlot>, MinerError>;
}

/// Rayon-parallel device used when no GPU backend is compiled in.
pub struct CpuDevice {
    algo: Option<Algorithm>,
    midstate: Vec<u32>,
    target: Vec<u32>,
    dispatch_size: u32,
}

impl CpuDevice {
    /// `workgroups` mirrors the GPU dispatch geometry; each carries the
    /// registry workgroup size of threads.
    pub fn new(workgroups: u32) -> Self {
        CpuDevice {
            algo: None,
            midstate: Vec::new(),
            target: Vec::new(),
            dispatch_size: workgroups.max(1) * 256,
        }
    }

    fn hash_for(&self, algo: Algorithm, nonce: u64) -> Option<[u8; 32]> {
        match algo {
            Algorithm::Sha256d => {
                let midstate: [u32; 8] = self.midstate.as_slice().try_into().ok()?;
                Some(sha256d_from_midstate(&midstate, nonce))
            }
            Algorithm::Blake3 | Algorithm::K12 => {
                // The word midstate is the raw preimage.
                let mut preimage = [0u8; 64];
                for (i, word) in self.midstate.iter().enumerate() {
                    preimage[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
                }
                verify::hash_candidate(algo, &hash_input(&preimage, nonce))
            }
            Algorithm::Argon2Light => None,
        }
    }

    /// The on-device comparison: bytes 4..12 against the 64-bit target
    /// under `LegacyV1`, the whole hash most-significant-word first under
    /// `Full256`.
    fn meets_target(&self, algo: Algorithm, hash: &[u8; 32]) -> bool {
        match algo.target_format() {
            crate::algo::TargetFormat::LegacyV1 => {
                let target = ((self.target[1] as u64) << 32) | self.target[2] as u64;
                verify::meets_legacy(hash, target)
            }
            crate::algo::TargetFormat::Full256 => {
                for (i, chunk) in hash.chunks_exact(4).enumerate() {
                    let word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    if word < self.target[i] {
                        return true;
                    }
                    if word > self.target[i] {
                        return false;
                    }
                }
                false
            }
        }
    }
}

impl SearchDevice for CpuDevice {
    fn configure(
        &mut self,
        algo: Algorithm,
        midstate_words: &[u32],
        target_words: &[u32],
    ) -> Result<(), MinerError> {
        if !algo.is_minable() {
            return Err(MinerError::UnsupportedAlgorithm(algo.name().to_string()));
        }
        self.algo = Some(algo);
        self.midstate = midstate_words.to_vec();
        self.target = target_words.to_vec();
        Ok(())
    }

    fn dispatch_size(&self) -> u32 {
        self.dispatch_size
    }

    fn dispatch(&mut self, nonce_hi: u32, nonce_offset: u32) -> Result<Vec<ResultSlot>, MinerError> {
        let algo = self
            .algo
            .ok_or_else(|| MinerError::DeviceUnavailable("device not configured".into()))?;

        let mut found: Vec<ResultSlot> = (0..self.dispatch_size)
            .into_par_iter()
            .filter_map(|i| {
                let nonce_lo = nonce_offset.wrapping_add(i);
                let nonce = ((nonce_hi as u64) << 32) | nonce_lo as u64;
                let hash = self.hash_for(algo, nonce)?;
                if !self.meets_target(algo, &hash) {
                    return None;
                }
                Some(ResultSlot {
                    nonce_lo,
                    hash_w0: u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]]),
                    hash_w1: u32::from_le_bytes([hash[4], hash[5], hash[6], hash[7]]),
                    flag: 1,
                })
            })
            .collect();

        // The driver only reads back the first slots; a crowded dispatch
        // drops the rest, which sane targets make rare.
        found.truncate(SLOTS_READ);
        Ok(found)
    }
}
