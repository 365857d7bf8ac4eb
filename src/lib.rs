// Library exports for dmint_miner

pub mod algo;
pub mod chain;
pub mod config;
pub mod contract;
pub mod coordinator;
pub mod engine;
pub mod error;

// Re-export main types for convenience
pub use chain::{ChainGateway, Discovery, WalletProvider};
pub use coordinator::{CoordinatorConfig, MinerStatusSnapshot, MintController};
pub use engine::{EngineHandle, MiningEngine};
pub use error::{MinerError, Result};
