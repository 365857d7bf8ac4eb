pub mod metadata;
pub mod script;
pub mod state;

pub use metadata::{DmintInfo, TokenMetadata};
pub use state::{
    classify_output, ContractState, ContractUpdate, ParsedOutput, StateHeader, Work, REF_LEN,
};
