pub mod cache;
pub mod gateway;
pub mod tx;
pub mod tx_builder;
pub mod wallet;

pub use cache::TxCache;
pub use gateway::{ChainGateway, ContractListing, Discovery, FetchedTx, RefLocations, StatusEvent};
pub use tx::{OutPoint, Transaction, TxInput, TxOutput};
pub use tx_builder::{ClaimBuilder, ClaimParams, FEE_PER_KB};
pub use wallet::{MiningKey, SingleKeyWallet, WalletProvider, WalletSnapshot};
