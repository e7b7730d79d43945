//! Offline trade wallet
//!
//! Multisig blobs are `hex("<stage>|<signer>|<body>")`. Every party derives the
//! shared address from the sorted set of all three prepared blobs, so three
//! honest parties agree on it and a party fed a different blob does not.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use super::chain::OfflineChain;
use super::tx::{SimulatedTx, TxKind, TxOutput};
use crate::error::{WalletError, WalletResult};
use crate::fee::{fee_share, FeeEstimate, FeePriority, DEPOSIT_TX_SIZE_BYTES, PAYOUT_TX_SIZE_BYTES};
use crate::service::{
    DepositTx, MultisigInitResult, PayoutDestination, PayoutTx, TradeTxExpectation, TradeWallet,
    VerifiedTradeTx, MULTISIG_THRESHOLD,
};

const STAGE_PREPARED: &str = "prepared";
const STAGE_MADE: &str = "made";
const STAGE_EXCHANGED: &str = "exchanged";
const STAGE_FINAL: &str = "final";
const STAGE_UPDATED: &str = "updated";

#[derive(Debug, Default)]
struct MultisigWallet {
    prepared_hex: Option<String>,
    all_prepared: Vec<String>,
    made_hex: Option<String>,
    exchanged_hex: Option<String>,
    address: Option<String>,
    imported_infos: usize,
}

struct Blob {
    stage: String,
    signer: String,
}

fn encode_blob(stage: &str, signer: &str, body: &str) -> String {
    hex::encode(format!("{stage}|{signer}|{body}"))
}

fn decode_blob(blob_hex: &str) -> WalletResult<Blob> {
    let bytes = hex::decode(blob_hex).map_err(|e| WalletError::InvalidMultisigHex(e.to_string()))?;
    let text =
        String::from_utf8(bytes).map_err(|e| WalletError::InvalidMultisigHex(e.to_string()))?;
    let mut parts = text.splitn(3, '|');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(stage), Some(signer), Some(_)) => Ok(Blob {
            stage: stage.to_string(),
            signer: signer.to_string(),
        }),
        _ => Err(WalletError::InvalidMultisigHex(
            "malformed multisig blob".to_string(),
        )),
    }
}

fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    hex::encode(hasher.finalize())
}

pub struct OfflineWallet {
    label: String,
    primary_address: String,
    password: String,
    chain: Arc<OfflineChain>,
    fee: FeeEstimate,
    wallets: Mutex<HashMap<String, MultisigWallet>>,
    deposit_shortfall: Mutex<Option<u64>>,
}

impl OfflineWallet {
    /// Create a wallet whose primary address is derived from `label`
    pub fn new(label: &str, chain: Arc<OfflineChain>) -> Self {
        Self {
            label: label.to_string(),
            primary_address: format!("8{}", &sha256_hex(&["primary", label])[..63]),
            password: sha256_hex(&["password", label]),
            chain,
            fee: FeeEstimate::fallback(FeePriority::Normal),
            wallets: Mutex::new(HashMap::new()),
            deposit_shortfall: Mutex::new(None),
        }
    }

    /// Estimate miner fees at `priority` instead of the normal level
    pub fn with_fee_priority(mut self, priority: FeePriority) -> Self {
        self.fee = FeeEstimate::fallback(priority);
        self
    }

    pub fn fee_priority(&self) -> FeePriority {
        self.fee.priority
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Make the next deposit send `amount` less into the multisig than requested
    pub fn understate_next_deposit_by(&self, amount: u64) {
        if let Ok(mut shortfall) = self.deposit_shortfall.lock() {
            *shortfall = Some(amount);
        }
    }

    fn wallets(&self) -> WalletResult<MutexGuard<'_, HashMap<String, MultisigWallet>>> {
        self.wallets
            .lock()
            .map_err(|_| WalletError::Signing("wallet state poisoned".to_string()))
    }

    fn check_password(&self, password: &str) -> WalletResult<()> {
        if password != self.password {
            return Err(WalletError::InvalidPassword);
        }
        Ok(())
    }

    /// Decode peer blobs, requiring the given stage and foreign signers
    fn peer_blobs(&self, hexes: &[String], stage: &str) -> WalletResult<()> {
        if hexes.len() != 2 {
            return Err(WalletError::MultisigStage(format!(
                "expected 2 peer blobs for {stage}, got {}",
                hexes.len()
            )));
        }
        for blob_hex in hexes {
            let blob = decode_blob(blob_hex)?;
            if blob.stage != stage {
                return Err(WalletError::MultisigStage(format!(
                    "expected {stage} blob, got {}",
                    blob.stage
                )));
            }
            if blob.signer == self.label {
                return Err(WalletError::InvalidMultisigHex(
                    "own blob passed as peer blob".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TradeWallet for OfflineWallet {
    fn primary_address(&self) -> String {
        self.primary_address.clone()
    }

    fn wallet_password(&self) -> String {
        self.password.clone()
    }

    async fn balance(&self) -> WalletResult<u64> {
        Ok(self.chain.balance(&self.primary_address))
    }

    async fn create_multisig_wallet(&self, trade_id: &str) -> WalletResult<()> {
        let mut wallets = self.wallets()?;
        wallets.entry(trade_id.to_string()).or_default();
        debug!(wallet = %self.label, trade_id = %trade_id, "Multisig wallet created");
        Ok(())
    }

    async fn prepare_multisig(&self, trade_id: &str) -> WalletResult<String> {
        let mut wallets = self.wallets()?;
        let wallet = wallets
            .get_mut(trade_id)
            .ok_or_else(|| WalletError::WalletNotFound(trade_id.to_string()))?;
        if let Some(existing) = &wallet.prepared_hex {
            return Ok(existing.clone());
        }
        let body = hex::encode(rand::random::<[u8; 16]>());
        let blob = encode_blob(STAGE_PREPARED, &self.label, &body);
        wallet.prepared_hex = Some(blob.clone());
        Ok(blob)
    }

    async fn make_multisig(
        &self,
        trade_id: &str,
        other_hexes: &[String],
        threshold: u32,
        password: &str,
    ) -> WalletResult<String> {
        self.check_password(password)?;
        if threshold != MULTISIG_THRESHOLD {
            return Err(WalletError::MultisigStage(format!(
                "unsupported threshold {threshold}"
            )));
        }
        self.peer_blobs(other_hexes, STAGE_PREPARED)?;

        let mut wallets = self.wallets()?;
        let wallet = wallets
            .get_mut(trade_id)
            .ok_or_else(|| WalletError::WalletNotFound(trade_id.to_string()))?;
        if let Some(existing) = &wallet.made_hex {
            return Ok(existing.clone());
        }
        let own = wallet
            .prepared_hex
            .clone()
            .ok_or_else(|| WalletError::MultisigStage("wallet not prepared".to_string()))?;

        let mut all: Vec<String> = other_hexes.to_vec();
        all.push(own);
        all.sort();
        let all_refs: Vec<&str> = all.iter().map(String::as_str).collect();
        let blob = encode_blob(STAGE_MADE, &self.label, &sha256_hex(&all_refs));
        wallet.all_prepared = all;
        wallet.made_hex = Some(blob.clone());
        Ok(blob)
    }

    async fn exchange_multisig_keys(
        &self,
        trade_id: &str,
        other_hexes: &[String],
        password: &str,
    ) -> WalletResult<MultisigInitResult> {
        self.check_password(password)?;
        let mut wallets = self.wallets()?;
        let wallet = wallets
            .get_mut(trade_id)
            .ok_or_else(|| WalletError::WalletNotFound(trade_id.to_string()))?;

        if let Some(address) = &wallet.address {
            return Ok(MultisigInitResult {
                multisig_hex: encode_blob(STAGE_FINAL, &self.label, address),
                address: Some(address.clone()),
            });
        }

        match &wallet.exchanged_hex {
            None => {
                if wallet.made_hex.is_none() {
                    return Err(WalletError::MultisigStage("multisig not made".to_string()));
                }
                self.peer_blobs(other_hexes, STAGE_MADE)?;
                let body = hex::encode(rand::random::<[u8; 16]>());
                let blob = encode_blob(STAGE_EXCHANGED, &self.label, &body);
                wallet.exchanged_hex = Some(blob.clone());
                Ok(MultisigInitResult {
                    multisig_hex: blob,
                    address: None,
                })
            }
            Some(_) => {
                self.peer_blobs(other_hexes, STAGE_EXCHANGED)?;
                let mut parts: Vec<&str> = vec!["multisig"];
                parts.extend(wallet.all_prepared.iter().map(String::as_str));
                let address = format!("4{}", &sha256_hex(&parts)[..63]);
                wallet.address = Some(address.clone());
                info!(wallet = %self.label, trade_id = %trade_id, "Multisig wallet complete");
                Ok(MultisigInitResult {
                    multisig_hex: encode_blob(STAGE_FINAL, &self.label, &address),
                    address: Some(address),
                })
            }
        }
    }

    async fn create_deposit_tx(
        &self,
        trade_id: &str,
        multisig_address: &str,
        fee_address: &str,
        trade_fee: u64,
        deposit_amount: u64,
    ) -> WalletResult<DepositTx> {
        let shortfall = self
            .deposit_shortfall
            .lock()
            .ok()
            .and_then(|mut s| s.take())
            .unwrap_or(0);
        let miner_fee = self.fee.calculate_fee(DEPOSIT_TX_SIZE_BYTES);
        let tx = SimulatedTx {
            kind: TxKind::Deposit,
            source: self.primary_address.clone(),
            outputs: vec![
                TxOutput {
                    address: multisig_address.to_string(),
                    amount: deposit_amount.saturating_sub(shortfall),
                },
                TxOutput {
                    address: fee_address.to_string(),
                    amount: trade_fee,
                },
            ],
            miner_fee,
            nonce: format!("{}:{}", trade_id, hex::encode(rand::random::<[u8; 16]>())),
            required_signatures: 1,
            signers: BTreeSet::from([self.label.clone()]),
        };

        let available = self.chain.balance(&self.primary_address);
        if available < tx.total_spent() {
            return Err(WalletError::InsufficientFunds {
                needed: tx.total_spent(),
                available,
            });
        }

        Ok(DepositTx {
            hash: tx.hash(),
            key: tx.tx_key(),
            hex: tx.to_hex()?,
            miner_fee,
        })
    }

    async fn verify_trade_tx(
        &self,
        expectation: &TradeTxExpectation,
        tx_hex: &str,
        tx_key: &str,
    ) -> WalletResult<VerifiedTradeTx> {
        let tx = SimulatedTx::from_hex(tx_hex)?;
        let hash = tx.hash();
        let fail = |reason: String| Err(WalletError::TradeTxVerification(reason));

        if tx.kind != TxKind::Deposit {
            return fail("not a deposit transaction".to_string());
        }
        if let Some(expected_hash) = &expectation.tx_hash {
            if expected_hash != &hash {
                return fail(format!("tx hash {hash} does not match expected {expected_hash}"));
            }
        }
        if tx.tx_key() != tx_key {
            return fail("tx key does not prove the deposit".to_string());
        }

        let expected_deposit = expectation.send_amount + expectation.security_deposit;
        let actual_deposit = tx.output_to(&expectation.multisig_address);
        if actual_deposit != expected_deposit {
            return fail(format!(
                "multisig output {actual_deposit} does not match send amount {} + security deposit {}",
                expectation.send_amount, expectation.security_deposit
            ));
        }
        let actual_fee = tx.output_to(&expectation.fee_address);
        if actual_fee != expectation.trade_fee {
            return fail(format!(
                "trade fee output {actual_fee} does not match expected {}",
                expectation.trade_fee
            ));
        }
        if tx.outputs.len() != 2 {
            return fail(format!("unexpected output count {}", tx.outputs.len()));
        }

        Ok(VerifiedTradeTx {
            hash,
            miner_fee: tx.miner_fee,
        })
    }

    async fn export_multisig_hex(&self, trade_id: &str) -> WalletResult<String> {
        let wallets = self.wallets()?;
        let wallet = wallets
            .get(trade_id)
            .ok_or_else(|| WalletError::WalletNotFound(trade_id.to_string()))?;
        if wallet.address.is_none() {
            return Err(WalletError::MultisigStage("multisig incomplete".to_string()));
        }
        let body = hex::encode(rand::random::<[u8; 8]>());
        Ok(encode_blob(STAGE_UPDATED, &self.label, &body))
    }

    async fn import_multisig_hex(&self, trade_id: &str, hexes: &[String]) -> WalletResult<usize> {
        for blob_hex in hexes {
            let blob = decode_blob(blob_hex)?;
            if blob.stage != STAGE_UPDATED || blob.signer == self.label {
                return Err(WalletError::InvalidMultisigHex(
                    "expected peer multisig info".to_string(),
                ));
            }
        }
        let mut wallets = self.wallets()?;
        let wallet = wallets
            .get_mut(trade_id)
            .ok_or_else(|| WalletError::WalletNotFound(trade_id.to_string()))?;
        wallet.imported_infos += hexes.len();
        Ok(hexes.len())
    }

    async fn create_payout_tx(
        &self,
        trade_id: &str,
        destinations: &[PayoutDestination],
    ) -> WalletResult<PayoutTx> {
        let address = {
            let wallets = self.wallets()?;
            let wallet = wallets
                .get(trade_id)
                .ok_or_else(|| WalletError::WalletNotFound(trade_id.to_string()))?;
            if wallet.imported_infos == 0 {
                return Err(WalletError::Signing(
                    "peer multisig info not imported".to_string(),
                ));
            }
            wallet
                .address
                .clone()
                .ok_or_else(|| WalletError::MultisigStage("multisig incomplete".to_string()))?
        };

        let paid: Vec<&PayoutDestination> = destinations.iter().filter(|d| d.amount > 0).collect();
        let gross: u64 = paid.iter().map(|d| d.amount).sum();
        let available = self.chain.balance(&address);
        if gross > available {
            return Err(WalletError::InsufficientFunds {
                needed: gross,
                available,
            });
        }

        let miner_fee = self.fee.calculate_fee(PAYOUT_TX_SIZE_BYTES);
        let mut outputs = Vec::with_capacity(paid.len());
        for (i, dest) in paid.iter().enumerate() {
            let share = fee_share(miner_fee, paid.len(), i);
            let amount = dest.amount.checked_sub(share).ok_or_else(|| {
                WalletError::InsufficientFunds {
                    needed: share,
                    available: dest.amount,
                }
            })?;
            outputs.push(TxOutput {
                address: dest.address.clone(),
                amount,
            });
        }

        // Same destinations from any party produce the same tx
        let dest_json = serde_json::to_string(&outputs).unwrap_or_default();
        let tx = SimulatedTx {
            kind: TxKind::Payout,
            source: address.clone(),
            outputs,
            miner_fee,
            nonce: sha256_hex(&["payout", &address, &dest_json]),
            required_signatures: MULTISIG_THRESHOLD,
            signers: BTreeSet::from([self.label.clone()]),
        };
        describe(&tx)
    }

    async fn sign_multisig_tx(&self, trade_id: &str, tx_hex: &str) -> WalletResult<PayoutTx> {
        let mut tx = SimulatedTx::from_hex(tx_hex)?;
        {
            let wallets = self.wallets()?;
            let wallet = wallets
                .get(trade_id)
                .ok_or_else(|| WalletError::WalletNotFound(trade_id.to_string()))?;
            if wallet.imported_infos == 0 {
                return Err(WalletError::Signing(
                    "peer multisig info not imported".to_string(),
                ));
            }
            if wallet.address.as_deref() != Some(tx.source.as_str()) {
                return Err(WalletError::Signing(
                    "transaction does not spend this trade's multisig".to_string(),
                ));
            }
        }
        tx.signers.insert(self.label.clone());
        describe(&tx)
    }

    async fn describe_payout_tx(&self, tx_hex: &str) -> WalletResult<PayoutTx> {
        let tx = SimulatedTx::from_hex(tx_hex)?;
        if tx.kind != TxKind::Payout {
            return Err(WalletError::InvalidTxHex("not a payout transaction".to_string()));
        }
        describe(&tx)
    }

    async fn close_multisig_wallet(&self, trade_id: &str) -> WalletResult<()> {
        self.wallets()?.remove(trade_id);
        Ok(())
    }
}

fn describe(tx: &SimulatedTx) -> WalletResult<PayoutTx> {
    Ok(PayoutTx {
        hash: tx.hash(),
        hex: tx.to_hex()?,
        miner_fee: tx.miner_fee,
        outputs: tx
            .outputs
            .iter()
            .map(|o| PayoutDestination::new(o.address.clone(), o.amount))
            .collect(),
        signature_count: tx.signers.len(),
    })
}
