//! Three nodes on one offline chain and one in-process network
//!
//! Every helper that waits also polls all three nodes against the chain, so
//! deposit and payout progress happens without the background poller.

use escrow_node::p2p::LocalNetwork;
use escrow_node::persistence::MemoryStore;
use escrow_node::{EscrowNode, NodeParams, ProtocolConfig, State, Trade};
use escrow_types::{
    KeyRing, NodeAddress, Offer, OfferDirection, PaymentAccountPayload, ATOMIC_UNITS_PER_COIN,
};
use escrow_wallet::{OfflineChain, OfflineWallet, TradeWallet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

pub const FUNDING: u64 = 10 * ATOMIC_UNITS_PER_COIN;
pub const TRADE_AMOUNT: u64 = ATOMIC_UNITS_PER_COIN;
pub const PRICE: u64 = 150 * ATOMIC_UNITS_PER_COIN;
pub const FEE_ADDRESS: &str = "fee-address";

const WAIT_LIMIT: Duration = Duration::from_secs(20);
const POLL_EVERY: Duration = Duration::from_millis(25);

/// Config with short windows so failures surface quickly
pub fn test_config() -> ProtocolConfig {
    ProtocolConfig {
        trade_timeout: Duration::from_secs(5),
        retry_delay: Duration::from_millis(50),
        persistence_debounce: Duration::from_millis(10),
        poll_interval: Duration::from_secs(3600),
        ..ProtocolConfig::default()
    }
}

pub fn payment_account(label: &str) -> PaymentAccountPayload {
    PaymentAccountPayload {
        id: format!("acct-{label}"),
        payment_method_id: "SEPA".to_string(),
        holder_name: format!("{label} Example"),
        account_number: format!("DE00{label}"),
    }
}

pub struct TestParty {
    pub label: &'static str,
    pub node: Arc<EscrowNode>,
    pub wallet: Arc<OfflineWallet>,
}

impl TestParty {
    fn spawn(
        label: &'static str,
        config: &ProtocolConfig,
        chain: &Arc<OfflineChain>,
        network: &Arc<LocalNetwork>,
    ) -> Self {
        let wallet = Arc::new(OfflineWallet::new(label, Arc::clone(chain)));
        let node = EscrowNode::new(NodeParams {
            config: config.clone(),
            node_address: NodeAddress::new(format!("{label}.onion:9999")),
            key_ring: KeyRing::generate(),
            wallet: wallet.clone(),
            daemon: chain.clone(),
            delivery: network.clone(),
            store: Arc::new(MemoryStore::new()),
            fee_address: FEE_ADDRESS.to_string(),
            payment_account: payment_account(label),
        });
        node.join(network);
        Self { label, node, wallet }
    }

    pub fn address(&self) -> &NodeAddress {
        self.node.address()
    }

    pub async fn trade(&self, trade_id: &str) -> Trade {
        self.node
            .trade(trade_id)
            .await
            .unwrap_or_else(|| panic!("{} has no trade {}", self.label, trade_id))
    }
}

pub struct TradeNetwork {
    pub config: ProtocolConfig,
    pub chain: Arc<OfflineChain>,
    pub network: Arc<LocalNetwork>,
    pub maker: TestParty,
    pub taker: TestParty,
    pub arbitrator: TestParty,
}

impl TradeNetwork {
    pub async fn start() -> Self {
        Self::start_with(test_config()).await
    }

    pub async fn start_with(config: ProtocolConfig) -> Self {
        let chain = Arc::new(OfflineChain::new());
        let network = LocalNetwork::new();
        let maker = TestParty::spawn("maker", &config, &chain, &network);
        let taker = TestParty::spawn("taker", &config, &chain, &network);
        let arbitrator = TestParty::spawn("arbitrator", &config, &chain, &network);

        for party in [&maker, &taker, &arbitrator] {
            party.node.start().await.expect("node starts");
        }
        chain.fund(&maker.wallet.primary_address(), FUNDING);
        chain.fund(&taker.wallet.primary_address(), FUNDING);

        Self {
            config,
            chain,
            network,
            maker,
            taker,
            arbitrator,
        }
    }

    pub fn parties(&self) -> [&TestParty; 3] {
        [&self.maker, &self.taker, &self.arbitrator]
    }

    /// On a sell offer the maker sells and the taker buys
    pub async fn create_offer(&self, direction: OfferDirection) -> Offer {
        self.maker
            .node
            .create_offer(
                direction,
                "EUR",
                PRICE,
                TRADE_AMOUNT,
                TRADE_AMOUNT / 2,
                (
                    self.arbitrator.address().clone(),
                    self.arbitrator.node.pub_key_ring().clone(),
                ),
            )
            .await
            .expect("offer created")
    }

    pub async fn take(&self, offer: &Offer) -> String {
        self.taker
            .node
            .take_offer(offer.clone(), offer.amount)
            .await
            .expect("offer taken")
    }

    pub async fn sync_all(&self) {
        for party in self.parties() {
            party.node.sync_with_chain().await;
        }
    }

    /// Wait until `party`'s trade satisfies `done`, polling the chain meanwhile
    pub async fn wait_until<F>(&self, party: &TestParty, trade_id: &str, what: &str, done: F) -> Trade
    where
        F: Fn(&Trade) -> bool,
    {
        let deadline = Instant::now() + WAIT_LIMIT;
        loop {
            if let Some(trade) = party.node.trade(trade_id).await {
                if done(&trade) {
                    return trade;
                }
                if Instant::now() > deadline {
                    panic!(
                        "{} never reached {} (state {}, dispute {}, error {:?})",
                        party.label,
                        what,
                        trade.state(),
                        trade.dispute_state,
                        trade.error_message
                    );
                }
            } else if Instant::now() > deadline {
                panic!("{} never saw trade {}", party.label, trade_id);
            }
            self.sync_all().await;
            sleep(POLL_EVERY).await;
        }
    }

    pub async fn wait_for_state(&self, party: &TestParty, trade_id: &str, state: State) -> Trade {
        self.wait_until(party, trade_id, &state.to_string(), |t| t.state() >= state)
            .await
    }

    /// Take a sell offer and run the trade until deposits are unlocked and
    /// every party holds both peers' updated multisig info
    pub async fn run_to_deposits_unlocked(&self) -> String {
        let offer = self.create_offer(OfferDirection::Sell).await;
        let trade_id = self.take(&offer).await;

        for party in self.parties() {
            self.wait_for_state(party, &trade_id, State::ArbitratorPublishedDepositTxs)
                .await;
        }
        self.chain.mine_blocks(self.config.confirmations_for_unlocked);
        for party in self.parties() {
            self.wait_for_state(party, &trade_id, State::DepositTxsUnlockedInBlockchain)
                .await;
            self.wait_until(party, &trade_id, "peer multisig info", |t| {
                t.peer_updated_multisig_hexes().len() == 2
            })
            .await;
        }
        trade_id
    }

    pub async fn multisig_address(&self, trade_id: &str) -> String {
        self.arbitrator
            .trade(trade_id)
            .await
            .process_model
            .multisig_address()
            .expect("multisig address set")
            .to_string()
    }

    pub async fn shutdown(&self) {
        for party in self.parties() {
            party.node.shutdown().await;
        }
    }
}
