//! Local K/V cache: raw transactions by txid, token groups by reference.
//! Persistence is best-effort JSON; a missing or corrupt file just starts
//! the cache empty.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    transactions: HashMap<String, String>,
    tokens: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct TxCache {
    path: Option<PathBuf>,
    data: CacheFile,
}

impl TxCache {
    /// In-memory cache, nothing persisted.
    pub fn in_memory() -> Self {
        TxCache::default()
    }

    pub fn open(path: PathBuf) -> Self {
        let data = fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        TxCache { path: Some(path), data }
    }

    pub fn get_tx(&self, txid: &[u8; 32]) -> Option<Vec<u8>> {
        self.data
            .transactions
            .get(&hex::encode(txid))
            .and_then(|raw| hex::decode(raw).ok())
    }

    pub fn insert_tx(&mut self, txid: [u8; 32], raw: &[u8]) {
        self.data.transactions.insert(hex::encode(txid), hex::encode(raw));
        self.flush();
    }

    pub fn get_token_group(&self, contract_ref: &[u8]) -> Option<Vec<u8>> {
        self.data
            .tokens
            .get(&hex::encode(contract_ref))
            .and_then(|raw| hex::decode(raw).ok())
    }

    pub fn insert_token_group(&mut self, contract_ref: &[u8], payload: &[u8]) {
        self.data.tokens.insert(hex::encode(contract_ref), hex::encode(payload));
        self.flush();
    }

    fn flush(&self) {
        let Some(path) = &self.path else { return };
        match serde_json::to_string(&self.data) {
            Ok(text) => {
                if let Err(e) = fs::write(path, text) {
                    debug!("could not persist tx cache to {:?}: {}", path, e);
                }
            }
            Err(e) => debug!("could not serialize tx cache: {}", e),
        }
    }
}
