//! Capability surfaces the core consumes from the chain side. The concrete
//! transport (electrum-style RPC, HTTP discovery) lives in the hosting
//! shell; the core sees only these traits.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::chain::tx::{OutPoint, TxOutput};
use crate::contract::REF_LEN;
use crate::error::MinerError;

/// Connection handshake deadline.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Interval between server pings.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// A ping without a reply inside this window declares disconnection.
pub const HEARTBEAT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
/// Back-off between candidate servers.
pub const SERVER_BACKOFF: Duration = Duration::from_secs(10);
/// Back-off after every server has been tried once.
pub const ROTATION_BACKOFF: Duration = Duration::from_secs(120);

/// A transaction as fetched from the chain: txid plus its outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedTx {
    pub txid: [u8; 32],
    pub outputs: Vec<TxOutput>,
}

/// Where a singleton reference was minted and where it currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefLocations {
    pub first: OutPoint,
    pub current: OutPoint,
}

/// One script-hash subscription callback. `status` is the server's opaque
/// status token; consumers deduplicate on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub script_hash: [u8; 32],
    pub status: String,
}

/// Chain access. Implementations must deliver `StatusEvent`s for one
/// script hash in the order the server emitted them.
#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Fetch a transaction; `fresh` bypasses any local cache.
    async fn fetch_tx(&self, txid: [u8; 32], fresh: bool) -> Result<FetchedTx, MinerError>;

    /// Resolve a singleton reference to its first and current locations.
    async fn fetch_ref(&self, contract_ref: &[u8; REF_LEN]) -> Result<RefLocations, MinerError>;

    /// Subscribe to script-hash status changes, delivered on `events`.
    async fn subscribe(
        &self,
        script_hash: [u8; 32],
        events: mpsc::Sender<StatusEvent>,
    ) -> Result<(), MinerError>;

    async fn unsubscribe(&self, script_hash: [u8; 32]) -> Result<(), MinerError>;

    /// Broadcast a raw transaction. A node reject surfaces as
    /// `MinerError::BroadcastRejected`; transport failures as
    /// `ChainUnavailable`.
    async fn broadcast(&self, raw_tx: Vec<u8>) -> Result<[u8; 32], MinerError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractListing {
    pub contract_ref: [u8; REF_LEN],
    pub num_contracts: u32,
}

/// Optional contract discovery. Failures are non-fatal; callers fall back
/// to their static contract list.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn list_contracts(&self) -> Result<Vec<ContractListing>, MinerError>;

    /// Raw CBOR metadata for a token, when the index has it.
    async fn extended_info(
        &self,
        contract_ref: &[u8; REF_LEN],
    ) -> Result<Option<Vec<u8>>, MinerError>;
}
