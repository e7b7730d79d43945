//! One protocol participant
//!
//! An [`EscrowNode`] wires a key ring, a wallet, a daemon and a delivery
//! service into the trade manager, both dispute tracks and the trader chat,
//! and routes every inbound message to the right one.

use async_trait::async_trait;
use chrono::Utc;
use escrow_types::{KeyRing, NodeAddress, Offer, OfferDirection, PaymentAccountPayload, PubKeyRing};
use escrow_wallet::{Daemon, TradeWallet};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::{self, ProtocolConfig};
use crate::error::{ProtocolError, ProtocolResult, SupportError, SupportResult};
use crate::models::{DisputeResult, SupportType, Trade};
use crate::p2p::{InboundHandler, LocalNetwork, MessageDelivery};
use crate::persistence::{PersistenceManager, TradeStore};
use crate::protocol::messages::{
    sort_mailbox_messages, AckSourceType, AvailabilityResult, ChatMessage, Envelope, Message,
};
use crate::protocol::{ProtocolServices, TradeProtocol};
use crate::services::trade_manager::{TradeEvent, TradeManager};
use crate::support::{
    DisputeDecision, DisputeManager, MediationManager, RefundTrack, TraderChatManager,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Everything a node needs from outside
pub struct NodeParams {
    pub config: ProtocolConfig,
    pub node_address: NodeAddress,
    pub key_ring: KeyRing,
    pub wallet: Arc<dyn TradeWallet>,
    pub daemon: Arc<dyn Daemon>,
    pub delivery: Arc<dyn MessageDelivery>,
    pub store: Arc<dyn TradeStore>,
    pub fee_address: String,
    pub payment_account: PaymentAccountPayload,
}

pub struct EscrowNode {
    services: Arc<ProtocolServices>,
    trades: Arc<TradeManager>,
    mediation: Arc<MediationManager>,
    refund: Arc<DisputeManager>,
    trader_chat: Arc<TraderChatManager>,
}

impl EscrowNode {
    pub fn new(params: NodeParams) -> Arc<Self> {
        let persistence = PersistenceManager::new(params.store, params.config.persistence_debounce);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let pub_key_ring = params.key_ring.pub_key_ring();
        let services = Arc::new(ProtocolServices {
            config: params.config,
            key_ring: Arc::new(params.key_ring),
            pub_key_ring,
            node_address: params.node_address,
            wallet: params.wallet,
            daemon: params.daemon,
            delivery: params.delivery,
            persistence,
            fee_address: params.fee_address,
            payment_account: params.payment_account,
            events,
        });
        let trades = TradeManager::new(Arc::clone(&services));
        Arc::new(Self {
            mediation: MediationManager::new(Arc::clone(&trades)),
            refund: RefundTrack::manager(Arc::clone(&trades)),
            trader_chat: TraderChatManager::new(Arc::clone(&trades)),
            services,
            trades,
        })
    }

    /// Restore stored trades and start background work
    pub async fn start(&self) -> ProtocolResult<()> {
        self.trades.start().await?;
        info!(
            address = %self.services.node_address,
            key = %self.services.short_id(),
            "🚀 Node started"
        );
        Ok(())
    }

    /// Register with an in-process network
    pub fn join(self: &Arc<Self>, network: &LocalNetwork) {
        let handler: Arc<dyn InboundHandler> = Arc::clone(self) as Arc<dyn InboundHandler>;
        let handler: Weak<dyn InboundHandler> = Arc::downgrade(&handler);
        network.register(
            self.services.node_address.clone(),
            self.services.pub_key_ring.clone(),
            handler,
        );
    }

    pub async fn shutdown(&self) {
        self.trades.shutdown().await;
    }

    pub fn address(&self) -> &NodeAddress {
        &self.services.node_address
    }

    pub fn pub_key_ring(&self) -> &PubKeyRing {
        &self.services.pub_key_ring
    }

    pub fn trade_manager(&self) -> &Arc<TradeManager> {
        &self.trades
    }

    pub fn mediation(&self) -> &Arc<MediationManager> {
        &self.mediation
    }

    pub fn refund(&self) -> &Arc<DisputeManager> {
        &self.refund
    }

    pub fn trader_chat(&self) -> &Arc<TraderChatManager> {
        &self.trader_chat
    }

    fn disputes(&self, support_type: SupportType) -> SupportResult<&Arc<DisputeManager>> {
        match support_type {
            SupportType::Mediation => Ok(self.mediation.disputes()),
            SupportType::Refund => Ok(&self.refund),
            SupportType::Trade => Err(SupportError::NotOpenable(
                "trader chat has no dispute".to_string(),
            )),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TradeEvent> {
        self.trades.subscribe()
    }

    pub async fn trade(&self, trade_id: &str) -> Option<Trade> {
        self.trades.trade(trade_id).await
    }

    async fn protocol(&self, trade_id: &str) -> ProtocolResult<Arc<TradeProtocol>> {
        self.trades
            .protocol(trade_id)
            .await
            .ok_or_else(|| ProtocolError::TradeNotFound(trade_id.to_string()))
    }

    // ========================================================================
    // Trading
    // ========================================================================

    /// Create an offer with this node as maker and publish it
    pub async fn create_offer(
        &self,
        direction: OfferDirection,
        currency_code: &str,
        price: u64,
        amount: u64,
        min_amount: u64,
        arbitrator: (NodeAddress, PubKeyRing),
    ) -> ProtocolResult<Offer> {
        let deposit_pct = config::get_security_deposit_pct();
        let offer = Offer {
            id: uuid::Uuid::new_v4().to_string(),
            direction,
            currency_code: currency_code.to_string(),
            price,
            amount,
            min_amount,
            buyer_security_deposit_pct: deposit_pct,
            seller_security_deposit_pct: deposit_pct,
            maker_node_address: self.services.node_address.clone(),
            maker_pub_key_ring: self.services.pub_key_ring.clone(),
            arbitrator_node_address: arbitrator.0,
            arbitrator_pub_key_ring: arbitrator.1,
            created_at: Utc::now(),
        };
        self.trades.place_offer(offer.clone()).await?;
        Ok(offer)
    }

    pub async fn check_offer_availability(
        &self,
        offer: &Offer,
        amount: u64,
    ) -> ProtocolResult<AvailabilityResult> {
        self.trades.check_offer_availability(offer, amount).await
    }

    pub async fn take_offer(&self, offer: Offer, amount: u64) -> ProtocolResult<String> {
        let protocol = self.trades.take_offer(offer, amount).await?;
        Ok(protocol.trade_id().to_string())
    }

    pub async fn confirm_payment_sent(
        &self,
        trade_id: &str,
        counter_currency_tx_id: Option<String>,
    ) -> ProtocolResult<()> {
        self.protocol(trade_id)
            .await?
            .confirm_payment_sent(counter_currency_tx_id)
            .await
    }

    pub async fn confirm_payment_received(&self, trade_id: &str) -> ProtocolResult<()> {
        self.protocol(trade_id).await?.confirm_payment_received().await
    }

    /// Poll the chain for every open trade once
    pub async fn sync_with_chain(&self) {
        self.trades.poll_once().await;
    }

    // ========================================================================
    // Support
    // ========================================================================

    pub async fn open_dispute(&self, trade_id: &str, support_type: SupportType) -> SupportResult<()> {
        self.disputes(support_type)?.open_dispute(trade_id).await.map(|_| ())
    }

    pub async fn send_chat_message(
        &self,
        trade_id: &str,
        support_type: SupportType,
        text: &str,
    ) -> SupportResult<ChatMessage> {
        match support_type {
            SupportType::Trade => self.trader_chat.send_chat_message(trade_id, text).await,
            _ => self.disputes(support_type)?.send_chat_message(trade_id, text).await,
        }
    }

    /// Lines exchanged with the other trader
    pub async fn trader_chat_messages(&self, trade_id: &str) -> Vec<ChatMessage> {
        self.trader_chat.chat_messages(trade_id).await
    }

    pub async fn close_dispute(
        &self,
        trade_id: &str,
        support_type: SupportType,
        decision: DisputeDecision,
    ) -> SupportResult<DisputeResult> {
        self.disputes(support_type)?.close_dispute(trade_id, decision).await
    }

    pub async fn accept_mediation_result(&self, trade_id: &str) -> SupportResult<()> {
        self.mediation.accept_mediation_result(trade_id).await
    }

    pub async fn reject_mediation_result(&self, trade_id: &str) -> SupportResult<()> {
        self.mediation.reject_mediation_result(trade_id).await
    }

    // ========================================================================
    // Inbound routing
    // ========================================================================

    async fn route(&self, envelope: Envelope) {
        match &envelope.message {
            Message::Ack(ack) => match ack.source_type {
                AckSourceType::TradeMessage => self.trades.on_trade_message(envelope).await,
                AckSourceType::MediationMessage => self.mediation.disputes().on_ack(envelope).await,
                AckSourceType::RefundMessage => self.refund.on_ack(envelope).await,
                AckSourceType::TradeChatMessage => self.trader_chat.on_ack(envelope).await,
            },
            Message::OfferAvailabilityRequest(_) | Message::OfferAvailabilityResponse(_) => {
                self.trades.on_offer_message(envelope).await
            }
            Message::Chat(chat) if chat.support_type == SupportType::Trade => {
                self.trader_chat.on_chat_message(envelope).await
            }
            Message::MediatedPayoutTxSignature(_) | Message::MediatedPayoutTxPublished(_) => {
                self.mediation.on_mediated_payout_message(envelope).await
            }
            Message::DisputeOpened(_)
            | Message::PeerOpenedDispute(_)
            | Message::DisputeClosed(_)
            | Message::Chat(_) => {
                let Some(support_type) = envelope.message.support_type() else {
                    return;
                };
                match self.disputes(support_type) {
                    Ok(disputes) => disputes.on_support_message(envelope).await,
                    Err(e) => warn!(
                        message = envelope.message.class_name(),
                        error = %e,
                        "Support message dropped"
                    ),
                }
            }
            _ => self.trades.on_trade_message(envelope).await,
        }
    }
}

#[async_trait]
impl InboundHandler for EscrowNode {
    async fn on_direct_message(&self, envelope: Envelope) {
        self.route(envelope).await;
    }

    async fn on_mailbox_messages(&self, mut envelopes: Vec<Envelope>) {
        sort_mailbox_messages(&mut envelopes);
        for envelope in envelopes {
            self.route(envelope).await;
        }
    }
}
