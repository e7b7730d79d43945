//! Daemon contract
//!
//! The daemon connection is shared by all trades of a node and used for
//! submission, relay and confirmation lookups. Implementations must be
//! thread-safe.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DaemonResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitTxResult {
    pub hash: String,
    /// The daemon already had this transaction (submitted, pooled or mined)
    pub already_known: bool,
    pub relayed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInfo {
    pub hash: String,
    pub relayed: bool,
    pub in_pool: bool,
    pub confirmations: u64,
}

#[async_trait]
pub trait Daemon: Send + Sync {
    /// Submit a transaction. With `do_not_relay` the daemon validates and holds
    /// it until [`Daemon::relay_txs_by_hash`].
    async fn submit_tx_hex(&self, tx_hex: &str, do_not_relay: bool)
        -> DaemonResult<SubmitTxResult>;

    /// Relay held transactions. Either all are relayed or none.
    async fn relay_txs_by_hash(&self, hashes: &[String]) -> DaemonResult<()>;

    /// Drop held (unrelayed) transactions
    async fn flush_tx_pool(&self, hashes: &[String]) -> DaemonResult<()>;

    async fn get_tx(&self, hash: &str) -> DaemonResult<Option<TxInfo>>;

    async fn height(&self) -> DaemonResult<u64>;
}
