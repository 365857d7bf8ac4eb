pub mod daa;
pub mod preimage;
pub mod verify;

use num_bigint::BigUint;
use num_traits::{One, Zero};

use crate::error::MinerError;

/// Largest representable target under `LegacyV1` (2^63 - 1).
pub const MAX_TARGET_LEGACY: u64 = i64::MAX as u64;

/// Hash families a dMint contract may select via its `algo_id` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha256d,
    Blake3,
    K12,
    Argon2Light,
}

/// Predicate used to compare a hash against the contract target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFormat {
    /// First four hash bytes must be zero; bytes 4..12 compared as a
    /// big-endian u64 against a 64-bit target.
    LegacyV1,
    /// Full 32-byte hash compared big-endian against a 256-bit target.
    Full256,
}

/// Static per-algorithm metadata consumed by the device driver.
pub struct AlgoDescriptor {
    pub name: &'static str,
    pub kernel_source: &'static str,
    pub workgroup_size: u32,
    /// u32 words per result slot: (nonce_lo, hash_w0, hash_w1, flag).
    pub result_arity: usize,
    pub midstate_bytes: usize,
    pub target_format: TargetFormat,
}

static SHA256D_DESC: AlgoDescriptor = AlgoDescriptor {
    name: "sha256d",
    kernel_source: include_str!("../engine/kernels/sha256d.cl"),
    workgroup_size: 256,
    result_arity: 4,
    midstate_bytes: 32,
    target_format: TargetFormat::LegacyV1,
};

static BLAKE3_DESC: AlgoDescriptor = AlgoDescriptor {
    name: "blake3",
    kernel_source: include_str!("../engine/kernels/blake3.cl"),
    workgroup_size: 256,
    result_arity: 4,
    midstate_bytes: 64,
    target_format: TargetFormat::Full256,
};

static K12_DESC: AlgoDescriptor = AlgoDescriptor {
    name: "k12",
    kernel_source: include_str!("../engine/kernels/k12.cl"),
    workgroup_size: 256,
    result_arity: 4,
    midstate_bytes: 64,
    target_format: TargetFormat::Full256,
};

static ARGON2_DESC: AlgoDescriptor = AlgoDescriptor {
    name: "argon2id-light",
    kernel_source: "",
    workgroup_size: 64,
    result_arity: 4,
    midstate_bytes: 64,
    target_format: TargetFormat::Full256,
};

impl Algorithm {
    pub fn from_id(id: u8) -> Result<Self, MinerError> {
        match id {
            0x00 => Ok(Algorithm::Sha256d),
            0x01 => Ok(Algorithm::Blake3),
            0x02 => Ok(Algorithm::K12),
            0x03 => Ok(Algorithm::Argon2Light),
            other => Err(MinerError::UnsupportedAlgorithm(format!(
                "algo id 0x{:02x}",
                other
            ))),
        }
    }

    pub fn from_name(name: &str) -> Result<Self, MinerError> {
        match name {
            "sha256d" => Ok(Algorithm::Sha256d),
            "blake3" => Ok(Algorithm::Blake3),
            "k12" => Ok(Algorithm::K12),
            "argon2id-light" | "argon2" => Ok(Algorithm::Argon2Light),
            other => Err(MinerError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    pub fn id(&self) -> u8 {
        match self {
            Algorithm::Sha256d => 0x00,
            Algorithm::Blake3 => 0x01,
            Algorithm::K12 => 0x02,
            Algorithm::Argon2Light => 0x03,
        }
    }

    pub fn descriptor(&self) -> &'static AlgoDescriptor {
        match self {
            Algorithm::Sha256d => &SHA256D_DESC,
            Algorithm::Blake3 => &BLAKE3_DESC,
            Algorithm::K12 => &K12_DESC,
            Algorithm::Argon2Light => &ARGON2_DESC,
        }
    }

    pub fn target_format(&self) -> TargetFormat {
        self.descriptor().target_format
    }

    pub fn name(&self) -> &'static str {
        self.descriptor().name
    }

    /// Argon2id-Light is registered but not minable until its on-chain
    /// definition freezes.
    pub fn is_minable(&self) -> bool {
        !matches!(self, Algorithm::Argon2Light)
    }
}

/// A contract target in the format its algorithm dictates. `Full` bytes are
/// big-endian (most significant byte first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Legacy(u64),
    Full([u8; 32]),
}

impl Target {
    pub fn format(&self) -> TargetFormat {
        match self {
            Target::Legacy(_) => TargetFormat::LegacyV1,
            Target::Full(_) => TargetFormat::Full256,
        }
    }

    /// `target = MAX_TARGET / difficulty`, in the given format.
    pub fn from_difficulty(format: TargetFormat, difficulty: u64) -> Self {
        let difficulty = difficulty.max(1);
        match format {
            TargetFormat::LegacyV1 => Target::Legacy(MAX_TARGET_LEGACY / difficulty),
            TargetFormat::Full256 => {
                let max = (BigUint::one() << 256u32) - BigUint::one();
                let quot = max / BigUint::from(difficulty);
                let bytes = quot.to_bytes_be();
                let mut out = [0u8; 32];
                out[32 - bytes.len()..].copy_from_slice(&bytes);
                Target::Full(out)
            }
        }
    }

    /// `difficulty = MAX_TARGET / target`, saturating at u64::MAX and
    /// never below 1.
    pub fn difficulty(&self) -> u64 {
        match self {
            Target::Legacy(t) => {
                if *t == 0 {
                    u64::MAX
                } else {
                    (MAX_TARGET_LEGACY / t).max(1)
                }
            }
            Target::Full(bytes) => {
                let target = BigUint::from_bytes_be(bytes);
                if target.is_zero() {
                    return u64::MAX;
                }
                let max = (BigUint::one() << 256u32) - BigUint::one();
                let diff = max / target;
                let limbs = diff.to_u64_digits();
                match limbs.len() {
                    0 => 1,
                    1 => limbs[0].max(1),
                    _ => u64::MAX,
                }
            }
        }
    }

    /// The u32 layout written into the device target buffer. `LegacyV1`:
    /// `[0, target_hi32, target_lo32]`; `Full256`: eight words, most
    /// significant first.
    pub fn device_words(&self) -> Vec<u32> {
        match self {
            Target::Legacy(t) => vec![0, (*t >> 32) as u32, *t as u32],
            Target::Full(bytes) => bytes
                .chunks_exact(4)
                .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
        }
    }

    pub fn to_be_bytes(&self) -> Vec<u8> {
        match self {
            Target::Legacy(t) => t.to_be_bytes().to_vec(),
            Target::Full(bytes) => bytes.to_vec(),
        }
    }

    pub fn from_state_bytes(format: TargetFormat, bytes: &[u8]) -> Result<Self, MinerError> {
        match format {
            TargetFormat::LegacyV1 => {
                if bytes.len() > 8 {
                    return Err(MinerError::StateInvalid(format!(
                        "legacy target push of {} bytes",
                        bytes.len()
                    )));
                }
                let mut buf = [0u8; 8];
                buf[8 - bytes.len()..].copy_from_slice(bytes);
                Ok(Target::Legacy(u64::from_be_bytes(buf)))
            }
            TargetFormat::Full256 => {
                if bytes.len() > 32 {
                    return Err(MinerError::StateInvalid(format!(
                        "256-bit target push of {} bytes",
                        bytes.len()
                    )));
                }
                let mut buf = [0u8; 32];
                buf[32 - bytes.len()..].copy_from_slice(bytes);
                Ok(Target::Full(buf))
            }
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Target::Legacy(t) => *t == 0,
            Target::Full(bytes) => bytes.iter().all(|b| *b == 0),
        }
    }
}
