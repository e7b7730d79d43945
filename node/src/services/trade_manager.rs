//! Trade manager
//!
//! Owns one [`TradeProtocol`] per trade, routes inbound trade messages and
//! ACKs to them, replays the stored trade list on start and polls the chain
//! for deposit and payout progress.

use async_trait::async_trait;
use escrow_types::Offer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config;
use crate::error::{ProtocolError, ProtocolResult};
use crate::models::{DisputeState, MediationResultState, Role, State, Trade};
use crate::persistence::{SnapshotSource, TradeRecord};
use crate::protocol::availability::{self, AvailabilityRequests};
use crate::protocol::messages::{AvailabilityResult, Envelope, Message};
use crate::protocol::outbox::send_ack;
use crate::protocol::{ProtocolServices, TradeProtocol};

/// Observable trade changes, published on the node's broadcast channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeEvent {
    Added { trade_id: String, role: Role },
    StateChanged { trade_id: String, state: State },
    DisputeStateChanged { trade_id: String, state: DisputeState },
    MediationResultChanged { trade_id: String, state: MediationResultState },
    Failed { trade_id: String, error: String },
    Completed { trade_id: String },
    Closed { trade_id: String },
}

impl TradeEvent {
    pub fn trade_id(&self) -> &str {
        match self {
            TradeEvent::Added { trade_id, .. }
            | TradeEvent::StateChanged { trade_id, .. }
            | TradeEvent::DisputeStateChanged { trade_id, .. }
            | TradeEvent::MediationResultChanged { trade_id, .. }
            | TradeEvent::Failed { trade_id, .. }
            | TradeEvent::Completed { trade_id }
            | TradeEvent::Closed { trade_id } => trade_id,
        }
    }
}

/// Which list a stored trade belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeListStatus {
    Active,
    Failed,
    Closed,
    Completed,
}

impl TradeListStatus {
    pub fn of(trade: &Trade) -> Self {
        if trade.is_completed() {
            TradeListStatus::Completed
        } else if trade.is_closed() {
            TradeListStatus::Closed
        } else if trade.is_failed() {
            TradeListStatus::Failed
        } else {
            TradeListStatus::Active
        }
    }
}

pub struct TradeManager {
    services: Arc<ProtocolServices>,
    protocols: RwLock<HashMap<String, Arc<TradeProtocol>>>,
    /// Offers this node made that nobody has taken yet
    open_offers: RwLock<HashMap<String, Offer>>,
    availability: AvailabilityRequests,
    poller: StdMutex<Option<JoinHandle<()>>>,
}

impl TradeManager {
    pub fn new(services: Arc<ProtocolServices>) -> Arc<Self> {
        Arc::new(Self {
            services,
            protocols: RwLock::new(HashMap::new()),
            open_offers: RwLock::new(HashMap::new()),
            availability: AvailabilityRequests::new(),
            poller: StdMutex::new(None),
        })
    }

    pub fn services(&self) -> &Arc<ProtocolServices> {
        &self.services
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TradeEvent> {
        self.services.events.subscribe()
    }

    /// Replay stored trades, start the persistence writer and the chain poll
    pub async fn start(self: &Arc<Self>) -> ProtocolResult<()> {
        let records = self
            .services
            .persistence
            .load()
            .await
            .map_err(|e| ProtocolError::Internal(format!("loading trade list: {e}")))?;
        let restored = records.len();
        {
            let mut protocols = self.protocols.write().await;
            for record in records {
                let trade_id = record.trade.id.clone();
                debug!(
                    trade_id = %crate::log_trade_id!(&trade_id),
                    status = ?record.status,
                    state = %record.trade.state(),
                    "Restoring trade"
                );
                let protocol = TradeProtocol::new(record.trade, Arc::clone(&self.services));
                protocols.insert(trade_id, protocol);
            }
        }

        let source: Arc<dyn SnapshotSource> = Arc::clone(self) as Arc<dyn SnapshotSource>;
        self.services.persistence.start(Arc::downgrade(&source)).await;
        self.start_polling();
        info!(restored, node = %self.services.short_id(), "Trade manager started");
        Ok(())
    }

    fn start_polling(self: &Arc<Self>) {
        let me: Weak<Self> = Arc::downgrade(self);
        let period = self.services.config.poll_interval;
        let handle = tokio::spawn(async move {
            let mut timer = interval(period);
            loop {
                timer.tick().await;
                let Some(manager) = me.upgrade() else {
                    return;
                };
                manager.poll_once().await;
            }
        });
        let mut poller = self.poller.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = poller.replace(handle) {
            previous.abort();
        }
    }

    /// Sync every open trade with the chain once
    pub async fn poll_once(&self) {
        for protocol in self.active_protocols().await {
            if let Err(e) = protocol.sync_with_chain().await {
                error!(
                    trade_id = %crate::log_trade_id!(protocol.trade_id()),
                    error = %e,
                    "Chain sync failed"
                );
            }
        }
    }

    pub async fn shutdown(&self) {
        if let Some(poller) = self.poller.lock().unwrap_or_else(|p| p.into_inner()).take() {
            poller.abort();
        }
        if let Err(e) = self.services.persistence.flush().await {
            error!(error = %e, "Final trade list write failed");
        }
    }

    // ========================================================================
    // Registry
    // ========================================================================

    pub async fn protocol(&self, trade_id: &str) -> Option<Arc<TradeProtocol>> {
        self.protocols.read().await.get(trade_id).cloned()
    }

    async fn active_protocols(&self) -> Vec<Arc<TradeProtocol>> {
        let protocols: Vec<_> = self.protocols.read().await.values().cloned().collect();
        let mut active = Vec::with_capacity(protocols.len());
        for protocol in protocols {
            if !protocol.snapshot().await.is_terminal() {
                active.push(protocol);
            }
        }
        active
    }

    pub async fn trade(&self, trade_id: &str) -> Option<Trade> {
        match self.protocol(trade_id).await {
            Some(protocol) => Some(protocol.snapshot().await),
            None => None,
        }
    }

    /// Snapshots of all trades in the given list
    pub async fn trades(&self, status: TradeListStatus) -> Vec<Trade> {
        let protocols: Vec<_> = self.protocols.read().await.values().cloned().collect();
        let mut trades = Vec::new();
        for protocol in protocols {
            let trade = protocol.snapshot().await;
            if TradeListStatus::of(&trade) == status {
                trades.push(trade);
            }
        }
        trades.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        trades
    }

    async fn register(&self, trade: Trade) -> ProtocolResult<Arc<TradeProtocol>> {
        let mut protocols = self.protocols.write().await;
        if protocols.contains_key(&trade.id) {
            return Err(ProtocolError::NotPermitted(format!(
                "trade {} already exists",
                trade.id
            )));
        }
        let trade_id = trade.id.clone();
        let role = trade.role;
        let protocol = TradeProtocol::new(trade, Arc::clone(&self.services));
        protocols.insert(trade_id.clone(), Arc::clone(&protocol));
        drop(protocols);

        info!(
            trade_id = %crate::log_trade_id!(&trade_id),
            role = %role,
            "📝 Trade added"
        );
        let _ = self.services.events.send(TradeEvent::Added { trade_id, role });
        self.services.persistence.request_persistence();
        Ok(protocol)
    }

    // ========================================================================
    // Local actions
    // ========================================================================

    /// Publish an offer made by this node so takers can reach it
    pub async fn place_offer(&self, offer: Offer) -> ProtocolResult<()> {
        if offer.maker_pub_key_ring != self.services.pub_key_ring {
            return Err(ProtocolError::NotPermitted(
                "offer was not made with this node's key ring".to_string(),
            ));
        }
        info!(
            offer_id = %crate::log_trade_id!(&offer.id),
            direction = offer.direction.as_str(),
            amount = %crate::log_amount!(offer.amount),
            "Offer placed"
        );
        self.open_offers.write().await.insert(offer.id.clone(), offer);
        Ok(())
    }

    pub async fn open_offers(&self) -> Vec<Offer> {
        self.open_offers.read().await.values().cloned().collect()
    }

    /// Ask the maker whether `offer` can still be taken for `amount`
    pub async fn check_offer_availability(
        &self,
        offer: &Offer,
        amount: u64,
    ) -> ProtocolResult<AvailabilityResult> {
        self.availability.request(&self.services, offer, amount).await
    }

    /// Take `offer` for `amount` and run the taker's first step
    pub async fn take_offer(&self, offer: Offer, amount: u64) -> ProtocolResult<Arc<TradeProtocol>> {
        if !offer.is_amount_in_range(amount) {
            return Err(ProtocolError::Verification(format!(
                "amount {amount} outside offer range"
            )));
        }
        let result = self.check_offer_availability(&offer, amount).await?;
        if result != AvailabilityResult::Available {
            info!(
                offer_id = %crate::log_trade_id!(&offer.id),
                result = %result,
                "Offer not available"
            );
            return Err(ProtocolError::OfferNotAvailable(result));
        }
        let trade = Trade::new(
            offer,
            Role::Taker,
            amount,
            config::maker_fee(amount),
            config::taker_fee(amount),
            self.services.node_address.clone(),
            self.services.pub_key_ring.clone(),
        );
        let protocol = self.register(trade).await?;
        protocol.take_offer().await?;
        Ok(protocol)
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Route one inbound trade message or ACK
    pub async fn on_trade_message(&self, envelope: Envelope) {
        let trade_id = envelope.message.trade_id().to_string();
        match &envelope.message {
            Message::Ack(_) => match self.protocol(&trade_id).await {
                Some(protocol) => protocol.on_ack(envelope).await,
                None => debug!(trade_id = %crate::log_trade_id!(&trade_id), "ACK for unknown trade"),
            },
            Message::InitTradeRequest(_) if self.protocol(&trade_id).await.is_none() => {
                self.on_init_trade_request(envelope).await;
            }
            _ => match self.protocol(&trade_id).await {
                Some(protocol) => {
                    let outcome = protocol.handle_message(envelope).await;
                    debug!(
                        trade_id = %crate::log_trade_id!(&trade_id),
                        outcome = ?outcome,
                        "Message handled"
                    );
                }
                None => {
                    warn!(
                        trade_id = %crate::log_trade_id!(&trade_id),
                        message = envelope.message.class_name(),
                        "Message for unknown trade"
                    );
                    send_ack(&self.services, &envelope, false, Some(format!("trade {trade_id} not found")))
                        .await;
                }
            },
        }
    }

    /// Availability requests and responses, outside any trade
    pub async fn on_offer_message(&self, envelope: Envelope) {
        match &envelope.message {
            Message::OfferAvailabilityRequest(request) => {
                let open = self.open_offers.read().await.get(&request.offer_id).cloned();
                let result = match open {
                    Some(offer) => availability::evaluate(&offer, request),
                    None if self.protocol(&request.offer_id).await.is_some() => {
                        AvailabilityResult::OfferTaken
                    }
                    None => AvailabilityResult::OfferRemoved,
                };
                availability::respond(&self.services, &envelope, request, result).await;
            }
            Message::OfferAvailabilityResponse(response) => {
                self.availability.on_response(&envelope, response);
            }
            _ => {}
        }
    }

    /// First contact for a trade: the taker reaching the maker, or the maker
    /// reaching the arbitrator
    async fn on_init_trade_request(&self, envelope: Envelope) {
        let Message::InitTradeRequest(request) = &envelope.message else {
            return;
        };
        let role = if request.offer.arbitrator_pub_key_ring == self.services.pub_key_ring {
            Role::Arbitrator
        } else if self.open_offers.read().await.contains_key(&request.offer.id) {
            Role::Maker
        } else {
            warn!(
                offer_id = %crate::log_trade_id!(&request.offer.id),
                "Trade request for an offer this node does not hold"
            );
            send_ack(&self.services, &envelope, false, Some("offer not available".to_string())).await;
            return;
        };

        let offer = match role {
            // Reserved while the request is checked; restored if it fails
            Role::Maker => match self.open_offers.write().await.remove(&request.offer.id) {
                Some(offer) => offer,
                None => {
                    send_ack(&self.services, &envelope, false, Some("offer already taken".to_string()))
                        .await;
                    return;
                }
            },
            _ => request.offer.clone(),
        };
        let amount = request.trade_amount;
        let trade = Trade::new(
            offer,
            role,
            amount,
            config::maker_fee(amount),
            request.taker_fee,
            self.services.node_address.clone(),
            self.services.pub_key_ring.clone(),
        );
        let protocol = match self.register(trade).await {
            Ok(protocol) => protocol,
            Err(e) => {
                // Lost a race with a concurrent request for the same trade
                warn!(error = %e, "Trade request not registered");
                if let Some(protocol) = self.protocol(envelope.message.trade_id()).await {
                    protocol.handle_message(envelope).await;
                }
                return;
            }
        };

        let outcome = protocol.handle_message(envelope).await;
        if outcome.is_success() {
            return;
        }
        warn!(
            trade_id = %crate::log_trade_id!(protocol.trade_id()),
            role = %role,
            outcome = ?outcome,
            "Trade request rejected"
        );
        if role == Role::Maker {
            self.release_reservation(&protocol).await;
        }
    }

    /// Drop a maker trade whose request never checked out and reopen its offer
    async fn release_reservation(&self, protocol: &Arc<TradeProtocol>) {
        let trade_id = protocol.trade_id();
        let removed = {
            let mut protocols = self.protocols.write().await;
            match protocols.get(trade_id) {
                Some(registered) if Arc::ptr_eq(registered, protocol) => protocols.remove(trade_id),
                _ => None,
            }
        };
        if removed.is_none() {
            return;
        }
        let offer = protocol.snapshot().await.offer;
        info!(
            offer_id = %crate::log_trade_id!(&offer.id),
            "Offer reopened after rejected trade request"
        );
        self.open_offers.write().await.insert(offer.id.clone(), offer);
        self.services.persistence.request_persistence();
    }
}

#[async_trait]
impl SnapshotSource for TradeManager {
    async fn snapshot(&self) -> Vec<TradeRecord> {
        let protocols: Vec<_> = self.protocols.read().await.values().cloned().collect();
        let mut records = Vec::with_capacity(protocols.len());
        for protocol in protocols {
            let trade = protocol.snapshot().await;
            records.push(TradeRecord {
                status: TradeListStatus::of(&trade),
                trade,
            });
        }
        records.sort_by(|a, b| a.trade.created_at.cmp(&b.trade.created_at));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::trade::tests::{sample_offer, sample_trade};
    use crate::persistence::{MemoryStore, TradeStore};
    use crate::protocol::test_support::test_services;
    use escrow_types::OfferDirection;

    #[test]
    fn test_list_status_follows_trade() {
        let mut trade = sample_trade(OfferDirection::Buy, Role::Maker);
        assert_eq!(TradeListStatus::of(&trade), TradeListStatus::Active);
        trade.mark_failed("boom");
        assert_eq!(TradeListStatus::of(&trade), TradeListStatus::Failed);
    }

    #[tokio::test]
    async fn test_take_offer_rejects_amount_outside_range() {
        let manager = TradeManager::new(Arc::new(test_services("taker")));
        let offer = sample_offer(OfferDirection::Sell);
        let too_much = offer.amount + 1;
        assert!(matches!(
            manager.take_offer(offer, too_much).await,
            Err(ProtocolError::Verification(_))
        ));
        assert!(manager.trades(TradeListStatus::Active).await.is_empty());
    }

    #[tokio::test]
    async fn test_take_offer_fails_when_maker_unreachable() {
        let manager = TradeManager::new(Arc::new(test_services("taker")));
        let offer = sample_offer(OfferDirection::Sell);
        let amount = offer.amount;
        assert!(matches!(
            manager.take_offer(offer, amount).await,
            Err(ProtocolError::Delivery(_))
        ));
        assert!(manager.trades(TradeListStatus::Active).await.is_empty());
    }

    #[tokio::test]
    async fn test_place_offer_requires_own_key() {
        let manager = TradeManager::new(Arc::new(test_services("maker")));
        let offer = sample_offer(OfferDirection::Buy);
        assert!(manager.place_offer(offer).await.is_err());
        assert!(manager.open_offers().await.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_lists_registered_trades() {
        let manager = TradeManager::new(Arc::new(test_services("maker")));
        let trade = sample_trade(OfferDirection::Buy, Role::Maker);
        let id = trade.id.clone();
        manager.register(trade).await.unwrap();
        assert!(manager.register(sample_trade(OfferDirection::Buy, Role::Maker)).await.is_err());

        let records = manager.snapshot().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].trade.id, id);
        assert_eq!(records[0].status, TradeListStatus::Active);

        let store = MemoryStore::new();
        store.save(&records).await.unwrap();
        assert_eq!(store.load().await.unwrap().len(), 1);
    }
}
