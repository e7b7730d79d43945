//! Multisig wallet construction
//!
//! Every party walks prepared -> made -> exchanged -> completed. A stage
//! advances once the blobs of both other parties for the previous stage are
//! on record; each advance is broadcast so the others can follow. A round
//! only completes once the update arrived at both other parties.

use async_trait::async_trait;
use escrow_wallet::MULTISIG_THRESHOLD;
use tracing::{error, info};

use super::contract::MaybeSendSignContractRequest;
use super::others;
use crate::error::{ProtocolError, ProtocolResult};
use crate::models::{MultisigStage, Phase, Role, State, Trade};
use crate::protocol::condition::Condition;
use crate::protocol::messages::{InitMultisigRequest, MessageHeader};
use crate::protocol::outbox::{send_to_peer, SendMode};
use crate::protocol::pipeline::{tasks, Pipeline, Task, TaskContext};
use crate::protocol::ProtocolServices;

pub fn init_multisig_pipeline(role: Role) -> Pipeline {
    Pipeline::new(
        "InitMultisig",
        Condition::new()
            .phase(&[Phase::Init])
            .from(&others(role))
            .ignore_when(|trade| trade.process_model.multisig_address().is_some()),
        tasks![ProcessInitMultisigRequest, MaybeSendSignContractRequest],
    )
}

fn record_own(trade: &mut Trade, stage: MultisigStage, hex: &str) -> ProtocolResult<()> {
    trade
        .self_peer_mut()
        .record_multisig_hex(stage, hex)
        .map(|_| ())
        .map_err(|stage| {
            ProtocolError::Internal(format!("own {} multisig hex changed", stage.as_str()))
        })
}

/// Blobs of both multisig peers for `stage`, once both are known
fn peer_hexes(trade: &Trade, stage: MultisigStage) -> Option<Vec<String>> {
    trade
        .rules()
        .multisig_peers
        .iter()
        .map(|role| trade.peer(*role).multisig_hex(stage).cloned())
        .collect()
}

/// Take every multisig step whose inputs are available. Returns whether a new
/// own blob was produced.
async fn advance_multisig(trade: &mut Trade, services: &ProtocolServices) -> ProtocolResult<bool> {
    let wallet = &services.wallet;
    let trade_id = trade.id.clone();
    let password = wallet.wallet_password();
    let mut updated = false;

    if trade.self_peer().prepared_multisig_hex.is_none() {
        wallet.create_multisig_wallet(&trade_id).await?;
        let hex = wallet.prepare_multisig(&trade_id).await?;
        record_own(trade, MultisigStage::Prepared, &hex)?;
        trade.advance_state(State::MultisigPrepared)?;
        updated = true;
    }

    if trade.self_peer().made_multisig_hex.is_none() {
        if let Some(hexes) = peer_hexes(trade, MultisigStage::Prepared) {
            let hex = wallet
                .make_multisig(&trade_id, &hexes, MULTISIG_THRESHOLD, &password)
                .await?;
            record_own(trade, MultisigStage::Made, &hex)?;
            trade.advance_state(State::MultisigMade)?;
            updated = true;
        }
    }

    if trade.self_peer().exchanged_multisig_hex.is_none() && trade.self_peer().made_multisig_hex.is_some() {
        if let Some(hexes) = peer_hexes(trade, MultisigStage::Made) {
            let result = wallet.exchange_multisig_keys(&trade_id, &hexes, &password).await?;
            record_own(trade, MultisigStage::Exchanged, &result.multisig_hex)?;
            trade.advance_state(State::MultisigExchanged)?;
            updated = true;
        }
    }

    if trade.process_model.multisig_address().is_none()
        && trade.self_peer().exchanged_multisig_hex.is_some()
    {
        if let Some(hexes) = peer_hexes(trade, MultisigStage::Exchanged) {
            let result = wallet.exchange_multisig_keys(&trade_id, &hexes, &password).await?;
            let address = result.address.ok_or_else(|| {
                ProtocolError::Internal("final key exchange yielded no address".to_string())
            })?;
            trade.process_model.set_multisig_address(&address)?;
            trade.advance_state(State::MultisigCompleted)?;
            info!(
                trade_id = %crate::log_trade_id!(&trade.id),
                role = %trade.role,
                address = %crate::log_address!(&address),
                "🔐 Multisig wallet completed"
            );
        }
    }

    Ok(updated)
}

/// Send this node's blobs to both other parties. Both must arrive.
async fn broadcast_multisig(trade: &Trade, services: &ProtocolServices) -> ProtocolResult<()> {
    let own = trade.self_peer();
    let request = InitMultisigRequest {
        header: MessageHeader::new(&trade.id, &services.node_address),
        prepared_multisig_hex: own.prepared_multisig_hex.clone(),
        made_multisig_hex: own.made_multisig_hex.clone(),
        exchanged_multisig_hex: own.exchanged_multisig_hex.clone(),
    };
    for role in others(trade.role) {
        if let Err(e) = send_to_peer(services, trade, role, request.clone(), SendMode::Direct).await {
            error!(
                trade_id = %crate::log_trade_id!(&trade.id),
                to = %role,
                error = %e,
                "InitMultisigRequest did not arrive"
            );
            return Err(e);
        }
    }
    Ok(())
}

/// Arbitrator: open the multisig round once the trade request checks out
pub struct ArbitratorPrepareMultisig;

#[async_trait]
impl Task for ArbitratorPrepareMultisig {
    fn name(&self) -> &'static str {
        "ArbitratorPrepareMultisig"
    }

    async fn run(&self, ctx: &mut TaskContext<'_>) -> ProtocolResult<()> {
        let services = ctx.services;
        let trade = &mut *ctx.trade;
        if advance_multisig(trade, services).await? {
            broadcast_multisig(trade, services).await?;
        }
        ctx.effects.start_timeout = true;
        Ok(())
    }
}

pub struct ProcessInitMultisigRequest;

#[async_trait]
impl Task for ProcessInitMultisigRequest {
    fn name(&self) -> &'static str {
        "ProcessInitMultisigRequest"
    }

    async fn run(&self, ctx: &mut TaskContext<'_>) -> ProtocolResult<()> {
        let request: &InitMultisigRequest = ctx.message()?;
        let sender = ctx.sender()?;
        let services = ctx.services;
        let trade = &mut *ctx.trade;

        let peer = trade.peer_mut(sender);
        for (stage, hex) in [
            (MultisigStage::Prepared, &request.prepared_multisig_hex),
            (MultisigStage::Made, &request.made_multisig_hex),
            (MultisigStage::Exchanged, &request.exchanged_multisig_hex),
        ] {
            if let Some(hex) = hex {
                peer.record_multisig_hex(stage, hex)
                    .map_err(|stage| ProtocolError::MultisigHexMismatch {
                        role: sender,
                        stage: stage.as_str(),
                    })?;
            }
        }

        if advance_multisig(trade, services).await? {
            broadcast_multisig(trade, services).await?;
        }
        Ok(())
    }
}
