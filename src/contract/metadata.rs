//! Token metadata, decoded from the CBOR payload minted alongside the
//! contract. Consumed for display and to seed the engine configuration;
//! absent or partial metadata falls back to SHA-256d with a fixed target.

use ciborium::Value;

use crate::algo::daa::{Breakpoint, DaaMode};
use crate::algo::Algorithm;
use crate::error::MinerError;

/// Protocol ids that must both be present for the token to be mineable.
const PROTO_FT: u64 = 1;
const PROTO_DMINT: u64 = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct TokenMetadata {
    pub protocols: Vec<u64>,
    pub version: Option<u64>,
    pub name: Option<String>,
    pub ticker: Option<String>,
    pub dmint: Option<DmintInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DmintInfo {
    pub algorithm: Algorithm,
    pub max_height: Option<u64>,
    pub reward: Option<u64>,
    pub premine: Option<u64>,
    pub difficulty: Option<u64>,
    pub daa: DaaMode,
}

impl TokenMetadata {
    pub fn decode(bytes: &[u8]) -> Result<Self, MinerError> {
        let root: Value = ciborium::de::from_reader(bytes)
            .map_err(|e| MinerError::StateInvalid(format!("token metadata: {}", e)))?;
        let Value::Map(entries) = root else {
            return Err(MinerError::StateInvalid("token metadata root is not a map".into()));
        };

        let protocols = match map_get(&entries, "p") {
            Some(Value::Array(items)) => items.iter().filter_map(as_u64).collect(),
            _ => Vec::new(),
        };
        let dmint = match map_get(&entries, "dmint") {
            Some(Value::Map(dmint_entries)) => Some(decode_dmint(dmint_entries)?),
            _ => None,
        };

        Ok(TokenMetadata {
            protocols,
            version: map_get(&entries, "v").and_then(as_u64),
            name: map_get(&entries, "name").and_then(as_text),
            ticker: map_get(&entries, "ticker").and_then(as_text),
            dmint,
        })
    }

    /// Mineable tokens declare both the FT and dMint protocols.
    pub fn is_mineable(&self) -> bool {
        self.protocols.contains(&PROTO_FT) && self.protocols.contains(&PROTO_DMINT)
    }

    /// Algorithm and DAA mode for the engine; defaults cover tokens minted
    /// before the metadata carried a `dmint` map.
    pub fn engine_config(&self) -> (Algorithm, DaaMode) {
        match &self.dmint {
            Some(info) => (info.algorithm, info.daa.clone()),
            None => (Algorithm::Sha256d, DaaMode::Fixed),
        }
    }
}

fn decode_dmint(entries: &[(Value, Value)]) -> Result<DmintInfo, MinerError> {
    let algorithm = match map_get(entries, "algo") {
        Some(value) => match value {
            Value::Integer(_) => Algorithm::from_id(
                as_u64(value)
                    .filter(|id| *id <= u8::MAX as u64)
                    .ok_or_else(|| MinerError::StateInvalid("dmint.algo out of range".into()))?
                    as u8,
            )?,
            Value::Text(name) => Algorithm::from_name(name)?,
            _ => return Err(MinerError::StateInvalid("dmint.algo has a bad type".into())),
        },
        None => Algorithm::Sha256d,
    };

    let daa = match map_get(entries, "daa") {
        Some(Value::Map(daa_entries)) => decode_daa(daa_entries)?,
        _ => DaaMode::Fixed,
    };
    daa.validate()?;

    Ok(DmintInfo {
        algorithm,
        max_height: map_get(entries, "maxHeight").and_then(as_u64),
        reward: map_get(entries, "reward").and_then(as_u64),
        premine: map_get(entries, "premine").and_then(as_u64),
        difficulty: map_get(entries, "diff").and_then(as_u64),
        daa,
    })
}

fn decode_daa(entries: &[(Value, Value)]) -> Result<DaaMode, MinerError> {
    let mode = map_get(entries, "mode")
        .and_then(as_text)
        .ok_or_else(|| MinerError::StateInvalid("daa map without a mode".into()))?;
    let params = match map_get(entries, "params") {
        Some(Value::Map(param_entries)) => param_entries.as_slice(),
        _ => &[],
    };
    let param = |key: &str| map_get(params, key).and_then(as_u64);

    match mode.as_str() {
        "fixed" => Ok(DaaMode::Fixed),
        "epoch" => Ok(DaaMode::Epoch {
            epoch_length: param("epochLength").unwrap_or(100),
            target_block_time: param("targetBlockTime").unwrap_or(300),
            max_adjustment: param("maxAdjustment").unwrap_or(4),
        }),
        "asert" => Ok(DaaMode::Asert {
            target_block_time: param("targetBlockTime").unwrap_or(300),
            half_life: param("halfLife").unwrap_or(3600),
            asymptote: param("asymptote").unwrap_or(0),
        }),
        "lwma" => Ok(DaaMode::Lwma {
            target_block_time: param("targetBlockTime").unwrap_or(300),
            window_size: param("windowSize").unwrap_or(60) as usize,
        }),
        "schedule" => {
            let Some(Value::Array(raw)) = map_get(params, "breakpoints") else {
                return Err(MinerError::StateInvalid("schedule daa without breakpoints".into()));
            };
            let mut breakpoints = Vec::with_capacity(raw.len());
            for item in raw {
                let Value::Array(pair) = item else {
                    return Err(MinerError::StateInvalid("schedule breakpoint is not a pair".into()));
                };
                let (Some(height), Some(difficulty)) =
                    (pair.first().and_then(as_u64), pair.get(1).and_then(as_u64))
                else {
                    return Err(MinerError::StateInvalid("schedule breakpoint is not numeric".into()));
                };
                breakpoints.push(Breakpoint { height, difficulty });
            }
            Ok(DaaMode::Schedule { breakpoints })
        }
        other => Err(MinerError::StateInvalid(format!("unknown daa mode '{}'", other))),
    }
}

fn map_get<'a>(entries: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    entries.iter().find_map(|(k, v)| match k {
        Value::Text(text) if text == key => Some(v),
        _ => None,
    })
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Integer(int) => u64::try_from(*int).ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Text(text) => Some(text.clone()),
        _ => None,
    }
}
