use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::algo::Algorithm;
use crate::contract::REF_LEN;
use crate::error::MinerError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub chain: ChainConfig,
    pub miner: MinerConfig,
    pub device: DeviceConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Preferred servers, tried in order.
    pub servers: Vec<String>,
    pub discovery_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerConfig {
    pub address: String,
    /// Contract reference as 72 hex chars (txid + vout, display order).
    pub contract_ref: String,
    pub mint_message: String,
    // Note: prefer the MINER_MNEMONIC environment variable; the config
    // file keeps the whole phrase as one opaque blob when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mnemonic: Option<String>,
    /// Override the algorithm advertised by token metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_difficulty: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daa_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_block_time: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Workgroup-count hint; each workgroup carries 256 threads.
    pub workgroups: u32,
    /// Memory ceiling for the argon2 family, in MiB. Recorded but unused
    /// until that algorithm is enabled.
    pub max_memory_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub cache_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chain: ChainConfig {
                servers: vec![
                    "wss://electrumx.radiant4people.com:50022".to_string(),
                    "wss://electrumx-01.radiant.ovh:50022".to_string(),
                ],
                discovery_url: "https://glyph.space/api".to_string(),
            },
            miner: MinerConfig {
                address: String::new(),
                contract_ref: String::new(),
                mint_message: String::new(),
                mnemonic: None,
                algorithm: None,
                initial_difficulty: None,
                daa_mode: None,
                target_block_time: None,
            },
            device: DeviceConfig {
                workgroups: (num_cpus::get() as u32).max(1),
                max_memory_mb: 512,
            },
            storage: StorageConfig {
                cache_path: default_cache_path(),
            },
        }
    }
}

fn default_cache_path() -> String {
    dirs::data_local_dir()
        .map(|dir| dir.join("dmint-miner").join("cache.json"))
        .and_then(|path| path.to_str().map(str::to_owned))
        .unwrap_or_else(|| "dmint_cache.json".to_string())
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl MinerConfig {
    /// Decode the configured reference into its subscription (reversed)
    /// form.
    pub fn contract_ref_le(&self) -> Result<[u8; REF_LEN], MinerError> {
        let bytes = hex::decode(self.contract_ref.trim())
            .map_err(|e| MinerError::ConfigInvalid(format!("contract ref: {}", e)))?;
        if bytes.len() != REF_LEN {
            return Err(MinerError::ConfigInvalid(format!(
                "contract ref must be {} bytes, got {}",
                REF_LEN,
                bytes.len()
            )));
        }
        let mut out = [0u8; REF_LEN];
        out.copy_from_slice(&bytes);
        out.reverse();
        Ok(out)
    }

    pub fn algorithm(&self) -> Result<Option<Algorithm>, MinerError> {
        self.algorithm
            .as_deref()
            .map(Algorithm::from_name)
            .transpose()
    }
}
