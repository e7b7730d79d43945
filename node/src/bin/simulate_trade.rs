//! Simulate one trade end to end
//!
//! Runs a maker, a taker and an arbitrator in-process over the offline chain
//! and network, walks a sell offer through the happy path and prints where
//! each party ended up.
//!
//! Usage: cargo run --bin simulate_trade
//!
//! Environment Variables:
//! - RUST_LOG: log filter (default: info,escrow_node=debug)
//! - ESCROW_TRADE_TIMEOUT_SECS and the other ESCROW_* settings

use anyhow::{bail, Context, Result};
use escrow_node::p2p::LocalNetwork;
use escrow_node::persistence::MemoryStore;
use escrow_node::{telemetry, EscrowNode, NodeParams, ProtocolConfig, State};
use escrow_types::{
    format_atomic, KeyRing, NodeAddress, OfferDirection, PaymentAccountPayload,
    ATOMIC_UNITS_PER_COIN,
};
use escrow_wallet::{OfflineChain, OfflineWallet, TradeWallet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const FUNDING: u64 = 10 * ATOMIC_UNITS_PER_COIN;
const STEP_TIMEOUT: Duration = Duration::from_secs(30);

struct Party {
    label: &'static str,
    node: Arc<EscrowNode>,
    wallet: Arc<OfflineWallet>,
}

fn spawn_party(
    label: &'static str,
    config: &ProtocolConfig,
    chain: &Arc<OfflineChain>,
    network: &Arc<LocalNetwork>,
) -> Party {
    let wallet = Arc::new(
        OfflineWallet::new(label, Arc::clone(chain)).with_fee_priority(config.fee_priority),
    );
    let node = EscrowNode::new(NodeParams {
        config: config.clone(),
        node_address: NodeAddress::new(format!("{label}.onion:9999")),
        key_ring: KeyRing::generate(),
        wallet: wallet.clone(),
        daemon: chain.clone(),
        delivery: network.clone(),
        store: Arc::new(MemoryStore::new()),
        fee_address: "simulation-fee-address".to_string(),
        payment_account: PaymentAccountPayload {
            id: format!("acct-{label}"),
            payment_method_id: "SEPA".to_string(),
            holder_name: format!("{label} simulation"),
            account_number: format!("DE00{label}"),
        },
    });
    node.join(network);
    Party { label, node, wallet }
}

/// Poll until the party's trade reaches `state`, syncing with the chain in between
async fn wait_for_state(party: &Party, trade_id: &str, state: State) -> Result<()> {
    let deadline = Instant::now() + STEP_TIMEOUT;
    loop {
        if let Some(trade) = party.node.trade(trade_id).await {
            if trade.state() >= state {
                return Ok(());
            }
            if trade.is_failed() {
                bail!(
                    "{} trade failed: {}",
                    party.label,
                    trade.error_message.unwrap_or_default()
                );
            }
        }
        if Instant::now() > deadline {
            bail!("{} did not reach {} in time", party.label, state);
        }
        party.node.sync_with_chain().await;
        sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let config = ProtocolConfig::from_env();
    let chain = Arc::new(OfflineChain::new());
    let network = LocalNetwork::new();

    let maker = spawn_party("maker", &config, &chain, &network);
    let taker = spawn_party("taker", &config, &chain, &network);
    let arbitrator = spawn_party("arbitrator", &config, &chain, &network);
    let parties = [&maker, &taker, &arbitrator];

    for party in parties {
        party.node.start().await.context("starting node")?;
    }
    chain.fund(&maker.wallet.primary_address(), FUNDING);
    chain.fund(&taker.wallet.primary_address(), FUNDING);

    println!("\n=== Offer ===");
    let offer = maker
        .node
        .create_offer(
            OfferDirection::Sell,
            "EUR",
            150 * ATOMIC_UNITS_PER_COIN,
            ATOMIC_UNITS_PER_COIN,
            ATOMIC_UNITS_PER_COIN / 2,
            (
                arbitrator.node.address().clone(),
                arbitrator.node.pub_key_ring().clone(),
            ),
        )
        .await
        .context("creating offer")?;
    println!("Offer {} for {}", offer.id, format_atomic(offer.amount));

    let trade_id = taker
        .node
        .take_offer(offer.clone(), offer.amount)
        .await
        .context("taking offer")?;

    println!("\n=== Deposits ===");
    for party in parties {
        wait_for_state(party, &trade_id, State::ArbitratorPublishedDepositTxs).await?;
    }
    chain.mine_blocks(config.confirmations_for_unlocked);
    // taker is the buyer on a sell offer
    wait_for_state(&taker, &trade_id, State::DepositTxsUnlockedInBlockchain).await?;
    wait_for_state(&maker, &trade_id, State::DepositTxsUnlockedInBlockchain).await?;

    println!("\n=== Payment ===");
    taker
        .node
        .confirm_payment_sent(&trade_id, Some("sepa-ref-001".to_string()))
        .await
        .context("confirming payment sent")?;
    wait_for_state(&maker, &trade_id, State::SellerReceivedPaymentSentMsg).await?;
    maker
        .node
        .confirm_payment_received(&trade_id)
        .await
        .context("confirming payment received")?;

    println!("\n=== Payout ===");
    chain.mine_blocks(config.payout_confirmations_for_completed);
    for party in [&maker, &taker] {
        wait_for_state(party, &trade_id, State::TradeCompleted).await?;
    }

    println!("\n=== Final states ===");
    for party in parties {
        if let Some(trade) = party.node.trade(&trade_id).await {
            println!(
                "{:<10} role={:<10} state={:<40} phase={:<20} balance={}",
                party.label,
                trade.role,
                trade.state(),
                trade.phase(),
                format_atomic(chain.balance(&party.wallet.primary_address())),
            );
        }
    }

    for party in parties {
        party.node.shutdown().await;
    }
    Ok(())
}
