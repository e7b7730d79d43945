//! In-process chain and daemon

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::tx::{SimulatedTx, TxKind};
use crate::daemon::{Daemon, SubmitTxResult, TxInfo};
use crate::error::{DaemonError, DaemonResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxStatus {
    /// Validated and held, not relayed
    Held,
    Pool,
    Mined { height: u64 },
}

#[derive(Debug)]
struct ChainTx {
    tx: SimulatedTx,
    status: TxStatus,
}

#[derive(Debug, Default)]
struct ChainState {
    height: u64,
    balances: HashMap<String, u64>,
    txs: HashMap<String, ChainTx>,
    /// Multisig addresses already spent by a relayed payout
    spent_multisig: HashSet<String>,
    reject_next_submission: Option<String>,
}

impl ChainState {
    fn balance(&self, address: &str) -> u64 {
        self.balances.get(address).copied().unwrap_or(0)
    }

    fn validate(&self, hash: &str, tx: &SimulatedTx) -> DaemonResult<()> {
        let reject = |reason: String| DaemonError::TxRejected {
            hash: hash.to_string(),
            reason,
        };

        if !tx.is_fully_signed() {
            return Err(reject(format!(
                "insufficient signatures: {} of {}",
                tx.signers.len(),
                tx.required_signatures
            )));
        }
        if tx.kind == TxKind::Payout && self.spent_multisig.contains(&tx.source) {
            return Err(reject("double spend of multisig funds".to_string()));
        }
        let available = self.balance(&tx.source);
        if available < tx.total_spent() {
            return Err(reject(format!(
                "insufficient funds at source: need {}, have {}",
                tx.total_spent(),
                available
            )));
        }
        Ok(())
    }

    /// Move a held tx into the pool, applying its balance effects
    fn relay(&mut self, hash: &str) -> DaemonResult<()> {
        let tx = match self.txs.get(hash) {
            Some(entry) if entry.status == TxStatus::Held => entry.tx.clone(),
            Some(_) => return Ok(()),
            None => return Err(DaemonError::TxNotFound(hash.to_string())),
        };
        self.validate(hash, &tx)?;

        let spent = tx.total_spent();
        if let Some(balance) = self.balances.get_mut(&tx.source) {
            *balance -= spent;
        }
        for output in &tx.outputs {
            *self.balances.entry(output.address.clone()).or_insert(0) += output.amount;
        }
        if tx.kind == TxKind::Payout {
            self.spent_multisig.insert(tx.source.clone());
        }
        if let Some(entry) = self.txs.get_mut(hash) {
            entry.status = TxStatus::Pool;
        }
        Ok(())
    }
}

/// Shared simulated daemon. All offline wallets of a test network point at one chain.
#[derive(Debug, Default)]
pub struct OfflineChain {
    state: Mutex<ChainState>,
}

impl OfflineChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> DaemonResult<MutexGuard<'_, ChainState>> {
        self.state
            .lock()
            .map_err(|_| DaemonError::Unavailable("chain state poisoned".to_string()))
    }

    /// Credit an address out of thin air (test and simulation funding)
    pub fn fund(&self, address: &str, amount: u64) {
        if let Ok(mut state) = self.state() {
            *state.balances.entry(address.to_string()).or_insert(0) += amount;
        }
    }

    pub fn balance(&self, address: &str) -> u64 {
        self.state().map(|s| s.balance(address)).unwrap_or(0)
    }

    /// Mine `blocks` blocks; pooled transactions are included in the first one
    pub fn mine_blocks(&self, blocks: u64) {
        if blocks == 0 {
            return;
        }
        if let Ok(mut state) = self.state() {
            let first = state.height + 1;
            for entry in state.txs.values_mut() {
                if entry.status == TxStatus::Pool {
                    entry.status = TxStatus::Mined { height: first };
                }
            }
            state.height += blocks;
            debug!(height = state.height, "Mined {} block(s)", blocks);
        }
    }

    /// Make the next submission fail with `reason`
    pub fn reject_next_submission(&self, reason: &str) {
        if let Ok(mut state) = self.state() {
            state.reject_next_submission = Some(reason.to_string());
        }
    }

    /// Number of relayed (pooled or mined) payouts spending `multisig_address`
    pub fn relayed_payouts_from(&self, multisig_address: &str) -> usize {
        self.state()
            .map(|s| {
                s.txs
                    .values()
                    .filter(|e| {
                        e.tx.kind == TxKind::Payout
                            && e.tx.source == multisig_address
                            && e.status != TxStatus::Held
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    /// Whether the transaction was relayed to the network (pooled or mined)
    pub fn is_relayed(&self, hash: &str) -> bool {
        self.state()
            .map(|s| {
                s.txs
                    .get(hash)
                    .map(|e| e.status != TxStatus::Held)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl Daemon for OfflineChain {
    async fn submit_tx_hex(
        &self,
        tx_hex: &str,
        do_not_relay: bool,
    ) -> DaemonResult<SubmitTxResult> {
        let tx = SimulatedTx::from_hex(tx_hex).map_err(|e| DaemonError::TxRejected {
            hash: String::new(),
            reason: e.to_string(),
        })?;
        let hash = tx.hash();
        let mut state = self.state()?;

        if let Some(reason) = state.reject_next_submission.take() {
            warn!(hash = %hash, "Rejecting submission: {}", reason);
            return Err(DaemonError::TxRejected { hash, reason });
        }

        if let Some(existing) = state.txs.get(&hash) {
            let relayed = existing.status != TxStatus::Held;
            if !relayed && !do_not_relay {
                state.relay(&hash)?;
            }
            return Ok(SubmitTxResult {
                hash,
                already_known: true,
                relayed: relayed || !do_not_relay,
            });
        }

        state.validate(&hash, &tx)?;
        state.txs.insert(
            hash.clone(),
            ChainTx {
                tx,
                status: TxStatus::Held,
            },
        );
        if !do_not_relay {
            state.relay(&hash)?;
            info!(hash = %hash, "Transaction relayed");
        }

        Ok(SubmitTxResult {
            hash,
            already_known: false,
            relayed: !do_not_relay,
        })
    }

    async fn relay_txs_by_hash(&self, hashes: &[String]) -> DaemonResult<()> {
        let mut state = self.state()?;
        for hash in hashes {
            let entry = state
                .txs
                .get(hash)
                .ok_or_else(|| DaemonError::TxNotFound(hash.clone()))?;
            if entry.status == TxStatus::Held {
                state.validate(hash, &entry.tx)?;
            }
        }
        for hash in hashes {
            state.relay(hash)?;
        }
        info!(count = hashes.len(), "Relayed held transactions");
        Ok(())
    }

    async fn flush_tx_pool(&self, hashes: &[String]) -> DaemonResult<()> {
        let mut state = self.state()?;
        for hash in hashes {
            if matches!(state.txs.get(hash), Some(e) if e.status == TxStatus::Held) {
                state.txs.remove(hash);
            }
        }
        Ok(())
    }

    async fn get_tx(&self, hash: &str) -> DaemonResult<Option<TxInfo>> {
        let state = self.state()?;
        Ok(state.txs.get(hash).map(|entry| {
            let confirmations = match entry.status {
                TxStatus::Mined { height } => state.height.saturating_sub(height) + 1,
                _ => 0,
            };
            TxInfo {
                hash: hash.to_string(),
                relayed: entry.status != TxStatus::Held,
                in_pool: entry.status == TxStatus::Pool,
                confirmations,
            }
        }))
    }

    async fn height(&self) -> DaemonResult<u64> {
        Ok(self.state()?.height)
    }
}
