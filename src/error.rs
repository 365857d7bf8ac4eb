use thiserror::Error;

#[derive(Error, Debug)]
pub enum MinerError {
    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Chain unavailable: {0}")]
    ChainUnavailable(String),

    #[error("Broadcast rejected: {0}")]
    BroadcastRejected(BroadcastRejection),

    #[error("Subscription lost: {0}")]
    SubscriptionLost(String),

    #[error("Contract burned at height {0}")]
    ContractBurned(u64),

    #[error("Wallet balance too low: have {have} photons, need {need}")]
    BalanceTooLow { have: u64, need: u64 },

    #[error("Not a dMint contract script")]
    NotAContract,

    #[error("Contract state invalid: {0}")]
    StateInvalid(String),

    #[error("Wallet error: {0}")]
    WalletError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl MinerError {
    /// Process exit code for errors that terminate the shell.
    pub fn exit_code(&self) -> i32 {
        match self {
            MinerError::ConfigInvalid(_) => 1,
            MinerError::UnsupportedAlgorithm(_) => 2,
            MinerError::DeviceUnavailable(_) => 3,
            _ => 1,
        }
    }
}

/// Classified broadcast failure, recognized from the node's reject reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastRejection {
    /// Another spend of the contract UTXO is already in the mempool.
    MempoolConflict,
    /// The script-sig did not satisfy the contract (stale nonce or state).
    ContractFail,
    /// One of our inputs no longer exists.
    MissingInputs,
    /// Fee below relay minimum or outputs exceed inputs.
    LowFee,
    /// Anything else; recorded as a reject and mining continues.
    Other(String),
}

impl BroadcastRejection {
    /// Map a node reject reason onto a rejection kind. Total: unknown
    /// strings land in `Other`.
    pub fn classify(reason: &str) -> Self {
        if reason.contains("txn-mempool-conflict") {
            BroadcastRejection::MempoolConflict
        } else if reason.contains("mandatory-script-verify-flag-failed") {
            BroadcastRejection::ContractFail
        } else if reason.contains("missing inputs") {
            BroadcastRejection::MissingInputs
        } else if reason.contains("min relay fee not met")
            || reason.contains("bad-txns-in-belowout")
        {
            BroadcastRejection::LowFee
        } else {
            BroadcastRejection::Other(reason.to_string())
        }
    }
}

impl std::fmt::Display for BroadcastRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BroadcastRejection::MempoolConflict => write!(f, "txn-mempool-conflict"),
            BroadcastRejection::ContractFail => {
                write!(f, "mandatory-script-verify-flag-failed")
            }
            BroadcastRejection::MissingInputs => write!(f, "missing inputs"),
            BroadcastRejection::LowFee => write!(f, "min relay fee not met"),
            BroadcastRejection::Other(reason) => write!(f, "{}", reason),
        }
    }
}

pub type Result<T> = std::result::Result<T, MinerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_reasons() {
        assert_eq!(
            BroadcastRejection::classify("258: txn-mempool-conflict"),
            BroadcastRejection::MempoolConflict
        );
        assert_eq!(
            BroadcastRejection::classify(
                "16: mandatory-script-verify-flag-failed (Script failed an OP_EQUALVERIFY operation)"
            ),
            BroadcastRejection::ContractFail
        );
        assert_eq!(
            BroadcastRejection::classify("missing inputs"),
            BroadcastRejection::MissingInputs
        );
        assert_eq!(
            BroadcastRejection::classify("66: min relay fee not met"),
            BroadcastRejection::LowFee
        );
        assert_eq!(
            BroadcastRejection::classify("bad-txns-in-belowout, value in < value out"),
            BroadcastRejection::LowFee
        );
    }

    #[test]
    fn test_classify_unknown_reason() {
        match BroadcastRejection::classify("64: scriptsig-not-pushonly") {
            BroadcastRejection::Other(reason) => {
                assert!(reason.contains("scriptsig-not-pushonly"))
            }
            other => panic!("expected Other, got {:?}", other),
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(MinerError::ConfigInvalid("x".into()).exit_code(), 1);
        assert_eq!(MinerError::UnsupportedAlgorithm("argon2".into()).exit_code(), 2);
        assert_eq!(MinerError::DeviceUnavailable("no gpu".into()).exit_code(), 3);
    }
}
