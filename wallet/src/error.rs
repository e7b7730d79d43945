//! Wallet and daemon error types

use thiserror::Error;

/// Errors raised by a [`crate::TradeWallet`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// No multisig wallet was created for this trade
    #[error("Multisig wallet not found for trade {0}")]
    WalletNotFound(String),

    /// A multisig step was called out of order
    #[error("Multisig stage error: {0}")]
    MultisigStage(String),

    /// Peer multisig blob could not be decoded
    #[error("Invalid multisig hex: {0}")]
    InvalidMultisigHex(String),

    #[error("Invalid transaction hex: {0}")]
    InvalidTxHex(String),

    /// Deposit or payout does not match the independently computed terms
    #[error("Trade tx verification failed: {0}")]
    TradeTxVerification(String),

    #[error("Insufficient funds: need {needed}, available {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Wallet password rejected")]
    InvalidPassword,

    #[error("Daemon error: {0}")]
    Daemon(#[from] DaemonError),
}

impl WalletError {
    /// Returns true if the error says a peer's transaction is wrong rather than our wallet
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            WalletError::TradeTxVerification(_)
                | WalletError::InvalidTxHex(_)
                | WalletError::InvalidMultisigHex(_)
        )
    }

    /// Returns true if retrying later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            WalletError::Daemon(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Errors raised by a [`crate::Daemon`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DaemonError {
    #[error("Transaction {hash} rejected: {reason}")]
    TxRejected { hash: String, reason: String },

    #[error("Transaction not found: {0}")]
    TxNotFound(String),

    #[error("Daemon unavailable: {0}")]
    Unavailable(String),
}

impl DaemonError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DaemonError::Unavailable(_))
    }
}

/// Result type for wallet operations
pub type WalletResult<T> = Result<T, WalletError>;

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_classification() {
        assert!(WalletError::TradeTxVerification("amount".into()).is_verification_failure());
        assert!(!WalletError::InsufficientFunds {
            needed: 2,
            available: 1
        }
        .is_verification_failure());
    }

    #[test]
    fn test_transient_only_for_unavailable_daemon() {
        assert!(WalletError::Daemon(DaemonError::Unavailable("down".into())).is_transient());
        assert!(!WalletError::Daemon(DaemonError::TxNotFound("h".into())).is_transient());
        assert!(!WalletError::Signing("x".into()).is_transient());
    }
}
