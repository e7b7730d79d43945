//! Wallet collaborator contracts for multisig escrow trades
//!
//! The trade protocol never talks to wallet RPC directly. It consumes:
//! - [`TradeWallet`]: per-trade 2-of-3 multisig wallets (prepare, make,
//!   exchange), deposit creation and verification, payout signing
//! - [`Daemon`]: shared transaction submission, relay and lookup
//!
//! The [`offline`] module provides deterministic in-process implementations
//! of both so trades can be exercised without a running daemon.

pub mod daemon;
pub mod error;
pub mod fee;
pub mod offline;
pub mod service;

pub use daemon::{Daemon, SubmitTxResult, TxInfo};
pub use error::{DaemonError, DaemonResult, WalletError, WalletResult};
pub use fee::{FeeEstimate, FeePriority};
pub use offline::{OfflineChain, OfflineWallet};
pub use service::{
    DepositTx, MultisigInitResult, PayoutDestination, PayoutTx, TradeTxExpectation, TradeWallet,
    VerifiedTradeTx, MULTISIG_THRESHOLD,
};
