//! Difficulty-adjustment algorithms.
//!
//! Five deterministic modes over integer fixed point. Nothing here may
//! touch floating point: outputs are compared bit-exactly against the
//! on-chain state other miners derive from the same history.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::MinerError;

use super::{Target, TargetFormat};

/// Fixed-point precision for Epoch and LWMA.
pub const PRECISION: u128 = 1_000_000;

/// Fixed-point radix for ASERT-lite (2^16).
pub const ASERT_RADIX: i128 = 1 << 16;

/// round(ln(2) * 2^16).
pub const LN2_SCALED: i128 = 45_426;

/// Bounded history length for LWMA.
pub const HISTORY_CAP: usize = 1000;

/// Solve times beyond `6 * target_block_time` are treated as this bound.
pub const SOLVE_TIME_CLAMP_FACTOR: u64 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub height: u64,
    pub difficulty: u64,
}

/// Difficulty-adjustment mode, as declared by the token's `daa` metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaaMode {
    /// Anchor difficulty, never adjusted.
    Fixed,
    /// Retarget every `epoch_length` blocks by the epoch's wall-clock ratio.
    Epoch {
        epoch_length: u64,
        target_block_time: u64,
        max_adjustment: u64,
    },
    /// Per-block exponential retarget against an absolute anchor.
    /// `asymptote = 0` disables the asymptote.
    Asert {
        target_block_time: u64,
        half_life: u64,
        asymptote: u64,
    },
    /// Linearly weighted moving average of recent solve times.
    Lwma {
        target_block_time: u64,
        window_size: usize,
    },
    /// Step function over predeclared breakpoints.
    Schedule { breakpoints: Vec<Breakpoint> },
}

impl DaaMode {
    pub fn name(&self) -> &'static str {
        match self {
            DaaMode::Fixed => "fixed",
            DaaMode::Epoch { .. } => "epoch",
            DaaMode::Asert { .. } => "asert",
            DaaMode::Lwma { .. } => "lwma",
            DaaMode::Schedule { .. } => "schedule",
        }
    }

    pub fn validate(&self) -> Result<(), MinerError> {
        match self {
            DaaMode::Fixed => Ok(()),
            DaaMode::Epoch {
                epoch_length,
                target_block_time,
                max_adjustment,
            } => {
                if *epoch_length == 0 || *target_block_time == 0 || *max_adjustment == 0 {
                    return Err(MinerError::ConfigInvalid(
                        "epoch DAA parameters must be positive".into(),
                    ));
                }
                Ok(())
            }
            DaaMode::Asert {
                target_block_time,
                half_life,
                ..
            } => {
                if *target_block_time == 0 || *half_life == 0 {
                    return Err(MinerError::ConfigInvalid(
                        "asert DAA parameters must be positive".into(),
                    ));
                }
                Ok(())
            }
            DaaMode::Lwma {
                target_block_time,
                window_size,
            } => {
                if *target_block_time == 0 || *window_size == 0 {
                    return Err(MinerError::ConfigInvalid(
                        "lwma DAA parameters must be positive".into(),
                    ));
                }
                Ok(())
            }
            DaaMode::Schedule { breakpoints } => {
                if breakpoints.is_empty() {
                    return Err(MinerError::ConfigInvalid("empty DAA schedule".into()));
                }
                let mut prev: Option<u64> = None;
                for bp in breakpoints {
                    if bp.difficulty == 0 {
                        return Err(MinerError::ConfigInvalid(format!(
                            "schedule difficulty 0 at height {}",
                            bp.height
                        )));
                    }
                    if let Some(p) = prev {
                        if bp.height <= p {
                            return Err(MinerError::ConfigInvalid(
                                "schedule heights must strictly increase".into(),
                            ));
                        }
                    }
                    prev = Some(bp.height);
                }
                Ok(())
            }
        }
    }
}

/// Per-contract DAA bookkeeping; owned 1-to-1 with the contract state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaaState {
    pub difficulty: u64,
    pub last_height: u64,
    pub last_time: u64,
    pub anchor_height: u64,
    pub anchor_time: u64,
    pub epoch_start_height: u64,
    pub epoch_start_time: u64,
    pub block_times: VecDeque<u64>,
    pub difficulties: VecDeque<u64>,
}

impl DaaState {
    pub fn new(difficulty: u64, height: u64, time: u64) -> Self {
        let mut block_times = VecDeque::new();
        block_times.push_back(time);
        let mut difficulties = VecDeque::new();
        difficulties.push_back(difficulty.max(1));
        DaaState {
            difficulty: difficulty.max(1),
            last_height: height,
            last_time: time,
            anchor_height: height,
            anchor_time: time,
            epoch_start_height: height,
            epoch_start_time: time,
            block_times,
            difficulties,
        }
    }

    /// Record an observed mint. Epoch anchors roll when the epoch boundary
    /// passes; the ASERT anchor never moves.
    pub fn record_block(&mut self, mode: &DaaMode, height: u64, time: u64, difficulty: u64) {
        self.difficulty = difficulty.max(1);
        self.last_height = height;
        self.last_time = time;
        self.block_times.push_back(time);
        self.difficulties.push_back(self.difficulty);
        while self.block_times.len() > HISTORY_CAP {
            self.block_times.pop_front();
        }
        while self.difficulties.len() > HISTORY_CAP {
            self.difficulties.pop_front();
        }
        if let DaaMode::Epoch { epoch_length, .. } = mode {
            if *epoch_length > 0 && height % epoch_length == 0 {
                self.epoch_start_height = height;
                self.epoch_start_time = time;
            }
        }
    }
}

/// Cubic fixed-point exponential: `R + x + x^2/2R + x^3/6R^2`, input
/// clamped to +/-4R, output clamped to at least 1.
pub fn fx_exp(x: i128) -> i128 {
    let x = x.clamp(-4 * ASERT_RADIX, 4 * ASERT_RADIX);
    let x2 = (x * x) / (2 * ASERT_RADIX);
    let x3 = (x * x * x) / (6 * ASERT_RADIX * ASERT_RADIX);
    (ASERT_RADIX + x + x2 + x3).max(1)
}

/// Next difficulty for a transition to `(new_height, new_time)`. Pure: the
/// same state and inputs always produce the same output.
pub fn next_difficulty(mode: &DaaMode, state: &DaaState, new_height: u64, new_time: u64) -> u64 {
    match mode {
        DaaMode::Fixed => state.difficulty.max(1),

        DaaMode::Epoch {
            epoch_length,
            target_block_time,
            max_adjustment,
        } => {
            if new_height % epoch_length != 0 {
                return state.difficulty.max(1);
            }
            let expected = (*epoch_length as u128) * (*target_block_time as u128);
            let actual = new_time.saturating_sub(state.epoch_start_time).max(1) as u128;
            let adj = (expected * PRECISION / actual)
                .clamp(PRECISION / *max_adjustment as u128, PRECISION * *max_adjustment as u128);
            let next = (state.difficulty as u128) * adj / PRECISION;
            clamp_u64(next)
        }

        DaaMode::Asert {
            target_block_time,
            half_life,
            asymptote,
        } => {
            let time_delta = new_time as i128 - state.anchor_time as i128;
            let height_delta = new_height as i128 - state.anchor_height as i128;
            let expected = height_delta * *target_block_time as i128;
            let exponent =
                (time_delta - expected) * LN2_SCALED / (*half_life as i128 * *target_block_time as i128);
            let factor = fx_exp(exponent);
            // Slow blocks (positive exponent) shed difficulty; fast blocks
            // gain it.
            let mut next = clamp_u64((state.difficulty as u128) * ASERT_RADIX as u128 / factor as u128);
            if *asymptote > 0 && next > *asymptote {
                next = *asymptote + (next - *asymptote) / 2;
            }
            next.max(1)
        }

        DaaMode::Lwma {
            target_block_time,
            window_size,
        } => {
            let clamp_max = SOLVE_TIME_CLAMP_FACTOR * target_block_time;
            let mut times: Vec<u64> = state.block_times.iter().copied().collect();
            times.push(new_time);
            if times.len() < 2 {
                return state.difficulty.max(1);
            }
            let solves: Vec<u64> = times
                .windows(2)
                .map(|w| w[1].saturating_sub(w[0]).clamp(1, clamp_max))
                .collect();
            let take = solves.len().min(*window_size);
            let recent = &solves[solves.len() - take..];

            // Linear weights, newest solve weighted heaviest.
            let mut weighted_sum: u128 = 0;
            let mut weight_total: u128 = 0;
            for (i, solve) in recent.iter().enumerate() {
                let weight = (i + 1) as u128;
                weighted_sum += weight * *solve as u128;
                weight_total += weight;
            }
            let weighted_mean = (weighted_sum / weight_total).max(1);
            let adj = *target_block_time as u128 * PRECISION / weighted_mean;
            // Clamp the output, not the ratio: P/3 truncates and would
            // leave the bound off by one part in 333333.
            let raw = state.difficulty as u128 * adj / PRECISION;
            let lower = (state.difficulty / 3).max(1) as u128;
            let upper = state.difficulty as u128 * 3;
            clamp_u64(raw.clamp(lower, upper))
        }

        DaaMode::Schedule { breakpoints } => {
            let mut out = breakpoints
                .first()
                .map(|bp| bp.difficulty)
                .unwrap_or(state.difficulty);
            for bp in breakpoints {
                if bp.height <= new_height {
                    out = bp.difficulty;
                } else {
                    break;
                }
            }
            out.max(1)
        }
    }
}

/// Next target in the format the algorithm dictates.
pub fn next_target(
    mode: &DaaMode,
    state: &DaaState,
    new_height: u64,
    new_time: u64,
    format: TargetFormat,
) -> Target {
    Target::from_difficulty(format, next_difficulty(mode, state, new_height, new_time))
}

fn clamp_u64(value: u128) -> u64 {
    value.min(u64::MAX as u128).max(1) as u64
}
