//! Per-trade protocol driver
//!
//! Owns the trade behind one async mutex. Every message and local action runs
//! as a pipeline on its own tokio task; the caller awaits the outcome through a
//! oneshot bounded by the trade timeout. Events and persistence requests are
//! emitted whenever a [`TradeGuard`] is released.

use futures::future::BoxFuture;
use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, Weak};
use tokio::sync::{oneshot, watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::chain_sync;
use super::messages::{Envelope, Message};
use super::outbox::send_ack;
use super::pipeline::{run_tasks, Pipeline, PipelineOutcome, TaskContext};
use super::tasks;
use super::ProtocolServices;
use crate::error::{ProtocolError, ProtocolResult};
use crate::models::{
    DisputeState, MediationResultState, Phase, ProcessingMessage, Role, State, Trade,
};
use crate::services::trade_manager::TradeEvent;

fn lock_std<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Values compared on guard release to emit events
#[derive(Debug, Clone, Copy)]
struct Snapshot {
    state: State,
    dispute_state: DisputeState,
    mediation_result_state: MediationResultState,
    failed: bool,
    closed: bool,
}

impl Snapshot {
    fn of(trade: &Trade) -> Self {
        Self {
            state: trade.state(),
            dispute_state: trade.dispute_state,
            mediation_result_state: trade.mediation_result_state,
            failed: trade.is_failed(),
            closed: trade.is_closed(),
        }
    }
}

/// Exclusive access to a trade
pub struct TradeGuard {
    trade: OwnedMutexGuard<Trade>,
    before: Snapshot,
    protocol: Arc<TradeProtocol>,
}

impl Deref for TradeGuard {
    type Target = Trade;

    fn deref(&self) -> &Trade {
        &self.trade
    }
}

impl DerefMut for TradeGuard {
    fn deref_mut(&mut self) -> &mut Trade {
        &mut self.trade
    }
}

impl Drop for TradeGuard {
    fn drop(&mut self) {
        self.protocol.publish_changes(self.before, &self.trade);
    }
}

pub struct TradeProtocol {
    trade_id: String,
    role: Role,
    trade: Arc<Mutex<Trade>>,
    services: Arc<ProtocolServices>,
    state: watch::Sender<State>,
    me: Weak<TradeProtocol>,
    progress_timeout: StdMutex<Option<JoinHandle<()>>>,
    subscriptions: StdMutex<Vec<JoinHandle<()>>>,
    retried: StdMutex<HashSet<String>>,
}

impl TradeProtocol {
    /// Wrap `trade`. Must be called within a tokio runtime.
    pub fn new(trade: Trade, services: Arc<ProtocolServices>) -> Arc<Self> {
        let terminal = trade.is_terminal();
        let (state, _) = watch::channel(trade.state());
        let protocol = Arc::new_cyclic(|me| Self {
            trade_id: trade.id.clone(),
            role: trade.role,
            trade: Arc::new(Mutex::new(trade)),
            services,
            state,
            me: me.clone(),
            progress_timeout: StdMutex::new(None),
            subscriptions: StdMutex::new(Vec::new()),
            retried: StdMutex::new(HashSet::new()),
        });
        if !terminal {
            protocol.subscribe_deposits_confirmed();
        }
        protocol
    }

    pub fn trade_id(&self) -> &str {
        &self.trade_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn services(&self) -> &Arc<ProtocolServices> {
        &self.services
    }

    pub fn subscribe_state(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    /// Lock the trade for modification
    pub async fn lock(self: &Arc<Self>) -> TradeGuard {
        let trade = Arc::clone(&self.trade).lock_owned().await;
        TradeGuard {
            before: Snapshot::of(&trade),
            trade,
            protocol: Arc::clone(self),
        }
    }

    /// Copy of the trade for reads and persistence
    pub async fn snapshot(&self) -> Trade {
        self.trade.lock().await.clone()
    }

    fn publish_changes(&self, before: Snapshot, trade: &Trade) {
        let events = &self.services.events;
        let trade_id = self.trade_id.clone();

        if trade.state() != before.state {
            self.state.send_replace(trade.state());
            let _ = events.send(TradeEvent::StateChanged {
                trade_id: trade_id.clone(),
                state: trade.state(),
            });
        }
        if trade.dispute_state != before.dispute_state {
            let _ = events.send(TradeEvent::DisputeStateChanged {
                trade_id: trade_id.clone(),
                state: trade.dispute_state,
            });
        }
        if trade.mediation_result_state != before.mediation_result_state {
            let _ = events.send(TradeEvent::MediationResultChanged {
                trade_id: trade_id.clone(),
                state: trade.mediation_result_state,
            });
        }

        let mut terminal = false;
        if !before.failed && trade.is_failed() {
            error!(
                trade_id = %crate::log_trade_id!(&trade_id),
                role = %self.role,
                error = trade.error_message.as_deref().unwrap_or_default(),
                "❌ Trade failed"
            );
            let _ = events.send(TradeEvent::Failed {
                trade_id: trade_id.clone(),
                error: trade.error_message.clone().unwrap_or_default(),
            });
            terminal = true;
        }
        if before.state != State::TradeCompleted && trade.is_completed() {
            info!(trade_id = %crate::log_trade_id!(&trade_id), role = %self.role, "✅ Trade completed");
            let _ = events.send(TradeEvent::Completed {
                trade_id: trade_id.clone(),
            });
            terminal = true;
        }
        if !before.closed && trade.is_closed() {
            info!(trade_id = %crate::log_trade_id!(&trade_id), role = %self.role, "Trade closed by dispute");
            let _ = events.send(TradeEvent::Closed { trade_id });
            terminal = true;
        }
        if terminal {
            self.stop_timeout();
            self.release_subscriptions();
        }

        self.services.persistence.request_persistence();
    }

    // ========================================================================
    // Pipelines
    // ========================================================================

    /// Apply an inbound trade message
    pub async fn handle_message(self: &Arc<Self>, envelope: Envelope) -> PipelineOutcome {
        let is_buyer = {
            let trade = self.trade.lock().await;
            trade.is_buyer()
        };
        let Some(pipeline) = tasks::message_pipeline(self.role, is_buyer, &envelope.message) else {
            warn!(
                trade_id = %crate::log_trade_id!(&self.trade_id),
                role = %self.role,
                message = envelope.message.class_name(),
                "No pipeline for message"
            );
            return PipelineOutcome::Ignored;
        };

        let uid = envelope.message.uid().to_string();
        let outcome = self.run_pipeline(pipeline, Some(envelope.clone())).await;
        match &outcome {
            PipelineOutcome::NotReady(error) => self.schedule_retry(envelope, error),
            PipelineOutcome::Deferred(state) => self.defer(envelope, *state),
            _ => {
                lock_std(&self.retried).remove(&uid);
            }
        }
        outcome
    }

    fn dispatch(self: Arc<Self>, envelope: Envelope) -> BoxFuture<'static, PipelineOutcome> {
        Box::pin(async move { self.handle_message(envelope).await })
    }

    /// Run `pipeline` under the trade lock and wait for its outcome
    pub async fn run_pipeline(
        self: &Arc<Self>,
        pipeline: Pipeline,
        envelope: Option<Envelope>,
    ) -> PipelineOutcome {
        let name = pipeline.name;
        let (tx, rx) = oneshot::channel();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut trade = this.lock().await;
            let outcome = this.execute(&mut trade, pipeline, envelope.as_ref()).await;
            drop(trade);
            let _ = tx.send(outcome);
        });

        let window = self.services.config.trade_timeout;
        match tokio::time::timeout(window, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => PipelineOutcome::Failed {
                task: name,
                error: ProtocolError::Internal("pipeline task ended without an outcome".into()),
            },
            Err(_) => {
                let secs = window.as_secs();
                self.fail_on_timeout(name, secs);
                PipelineOutcome::TimedOut { secs }
            }
        }
    }

    async fn execute(
        &self,
        trade: &mut Trade,
        pipeline: Pipeline,
        envelope: Option<&Envelope>,
    ) -> PipelineOutcome {
        let services = &*self.services;

        if trade.is_terminal() {
            return match envelope {
                Some(envelope) => {
                    debug!(
                        trade_id = %crate::log_trade_id!(&trade.id),
                        message = envelope.message.class_name(),
                        "Trade is terminal, dropping message"
                    );
                    PipelineOutcome::Ignored
                }
                None => PipelineOutcome::Rejected(ProtocolError::NotPermitted(format!(
                    "{} on a terminal trade",
                    pipeline.name
                ))),
            };
        }

        if let Some(envelope) = envelope {
            if trade.process_model.is_processed(envelope.message.uid()) {
                info!(
                    trade_id = %crate::log_trade_id!(&trade.id),
                    message = envelope.message.class_name(),
                    "Message already applied, acknowledging only"
                );
                send_ack(services, envelope, true, None).await;
                return PipelineOutcome::Duplicate;
            }
            if let Some(required) = pipeline.wait_for {
                if trade.state() < required {
                    return PipelineOutcome::Deferred(required);
                }
            }
        }

        let sender = match pipeline.condition.check(trade, envelope) {
            Ok(sender) => sender,
            Err(e) if e.is_transient() => return PipelineOutcome::NotReady(e),
            Err(e) => {
                warn!(
                    trade_id = %crate::log_trade_id!(&trade.id),
                    pipeline = pipeline.name,
                    error = %e,
                    "Rejected"
                );
                if let Some(envelope) = envelope {
                    send_ack(services, envelope, false, Some(e.to_string())).await;
                }
                return PipelineOutcome::Rejected(e);
            }
        };

        if pipeline.condition.should_ignore(trade) {
            if let Some(envelope) = envelope {
                info!(
                    trade_id = %crate::log_trade_id!(&trade.id),
                    message = envelope.message.class_name(),
                    state = %trade.state(),
                    "Already past this step, acknowledging only"
                );
                trade.process_model.mark_processed(envelope.message.uid());
                send_ack(services, envelope, true, None).await;
            }
            return PipelineOutcome::Ignored;
        }

        trade.process_model.current_message = envelope.map(|e| ProcessingMessage {
            uid: e.message.uid().to_string(),
            sender: e.sender_node_address.clone(),
        });
        let mut ctx = TaskContext::new(trade, services, envelope, sender);
        let result = run_tasks(&pipeline.tasks, &mut ctx).await;
        let effects = ctx.effects;
        trade.process_model.current_message = None;

        match result {
            Ok(()) => {
                if effects.start_timeout {
                    self.start_timeout();
                }
                if effects.stop_timeout {
                    self.stop_timeout();
                }
                if let Some(envelope) = envelope {
                    trade.process_model.mark_processed(envelope.message.uid());
                    send_ack(services, envelope, true, None).await;
                }
                debug!(
                    trade_id = %crate::log_trade_id!(&trade.id),
                    pipeline = pipeline.name,
                    state = %trade.state(),
                    "Pipeline completed"
                );
                PipelineOutcome::Completed
            }
            Err(failure) => {
                error!(
                    trade_id = %crate::log_trade_id!(&trade.id),
                    role = %trade.role,
                    pipeline = pipeline.name,
                    task = failure.task,
                    error = %failure.error,
                    "Protocol task failed"
                );
                let message = failure.error.to_string();
                if let Some(envelope) = envelope {
                    send_ack(services, envelope, false, Some(message.clone())).await;
                }
                self.stop_timeout();
                trade.error_message = Some(message.clone());
                if trade.phase() == Phase::Init {
                    trade.mark_failed(message);
                }
                PipelineOutcome::Failed {
                    task: failure.task,
                    error: failure.error,
                }
            }
        }
    }

    fn fail_on_timeout(self: &Arc<Self>, pipeline: &'static str, secs: u64) {
        error!(
            trade_id = %crate::log_trade_id!(&self.trade_id),
            pipeline,
            secs,
            "Pipeline did not complete in time"
        );
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut trade = this.lock().await;
            let message = ProtocolError::Timeout { secs }.to_string();
            if trade.phase() == Phase::Init && !trade.is_terminal() {
                trade.mark_failed(message);
            } else {
                trade.error_message = Some(message);
            }
        });
    }

    fn schedule_retry(self: &Arc<Self>, envelope: Envelope, error: &ProtocolError) {
        let uid = envelope.message.uid().to_string();
        let first = lock_std(&self.retried).insert(uid.clone());
        if !first {
            lock_std(&self.retried).remove(&uid);
            warn!(
                trade_id = %crate::log_trade_id!(&self.trade_id),
                message = envelope.message.class_name(),
                error = %error,
                "Message still not applicable after retry, dropping"
            );
            return;
        }

        let delay = self.services.config.retry_delay;
        info!(
            trade_id = %crate::log_trade_id!(&self.trade_id),
            message = envelope.message.class_name(),
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "Message arrived early, retrying"
        );
        let me = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(protocol) = me.upgrade() {
                protocol.dispatch(envelope).await;
            }
        });
    }

    fn defer(self: &Arc<Self>, envelope: Envelope, required: State) {
        debug!(
            trade_id = %crate::log_trade_id!(&self.trade_id),
            message = envelope.message.class_name(),
            required = %required,
            "Deferring message until state is reached"
        );
        let mut rx = self.state.subscribe();
        let me = self.me.clone();
        let window = self.services.config.trade_timeout;
        let handle = tokio::spawn(async move {
            let reached = matches!(
                tokio::time::timeout(window, rx.wait_for(|s| *s >= required)).await,
                Ok(Ok(_))
            );
            if !reached {
                warn!(
                    message = envelope.message.class_name(),
                    required = %required,
                    "Deferred message expired"
                );
                return;
            }
            if let Some(protocol) = me.upgrade() {
                protocol.dispatch(envelope).await;
            }
        });
        self.track(handle);
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut subscriptions = lock_std(&self.subscriptions);
        subscriptions.retain(|h| !h.is_finished());
        subscriptions.push(handle);
    }

    fn release_subscriptions(&self) {
        for handle in lock_std(&self.subscriptions).drain(..) {
            handle.abort();
        }
    }

    // ========================================================================
    // Progress timeout
    // ========================================================================

    pub fn start_timeout(&self) {
        let me = self.me.clone();
        let window = self.services.config.trade_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(protocol) = me.upgrade() {
                protocol.on_progress_timeout(window.as_secs()).await;
            }
        });
        if let Some(previous) = lock_std(&self.progress_timeout).replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_timeout(&self) {
        if let Some(handle) = lock_std(&self.progress_timeout).take() {
            handle.abort();
        }
    }

    async fn on_progress_timeout(self: &Arc<Self>, secs: u64) {
        lock_std(&self.progress_timeout).take();
        let mut trade = self.lock().await;
        if trade.phase() == Phase::Init && !trade.is_terminal() {
            warn!(
                trade_id = %crate::log_trade_id!(&self.trade_id),
                state = %trade.state(),
                "Trade did not publish its deposits in time"
            );
            trade.mark_failed(ProtocolError::Timeout { secs }.to_string());
        }
    }

    // ========================================================================
    // Local actions
    // ========================================================================

    /// Taker: send the trade request to the maker
    pub async fn take_offer(self: &Arc<Self>) -> ProtocolResult<()> {
        self.run_pipeline(tasks::init::take_offer_pipeline(), None)
            .await
            .into_result()
    }

    /// Buyer: confirm the counter-currency payment was sent
    pub async fn confirm_payment_sent(
        self: &Arc<Self>,
        counter_currency_tx_id: Option<String>,
    ) -> ProtocolResult<()> {
        if !self.trade.lock().await.is_buyer() {
            return Err(ProtocolError::NotPermitted("only the buyer confirms payment sent".into()));
        }
        self.run_pipeline(tasks::payment::payment_sent_pipeline(counter_currency_tx_id), None)
            .await
            .into_result()
    }

    /// Seller: confirm the payment arrived, then sign and publish the payout
    pub async fn confirm_payment_received(self: &Arc<Self>) -> ProtocolResult<()> {
        if !self.trade.lock().await.is_seller() {
            return Err(ProtocolError::NotPermitted(
                "only the seller confirms payment received".into(),
            ));
        }
        self.run_pipeline(tasks::payment::payment_received_pipeline(), None)
            .await
            .into_result()
    }

    // ========================================================================
    // ACKs, chain sync, subscriptions
    // ========================================================================

    /// Record an ACK for a trade message this node sent
    pub async fn on_ack(self: &Arc<Self>, envelope: Envelope) {
        let Message::Ack(ack) = &envelope.message else {
            return;
        };
        let mut trade = self.lock().await;
        let own_role = trade.role;
        let sender = [Role::Maker, Role::Taker, Role::Arbitrator]
            .into_iter()
            .filter(|role| *role != own_role)
            .find(|role| trade.peer(*role).pub_key_ring.as_ref() == Some(&envelope.sender_pub_key_ring));
        let Some(sender) = sender else {
            warn!(
                trade_id = %crate::log_trade_id!(&self.trade_id),
                "ACK from unknown key ignored"
            );
            return;
        };

        trade
            .peer_mut(sender)
            .ack_status
            .insert(ack.source_msg_class_name.clone(), ack.success);

        if ack.success {
            debug!(
                trade_id = %crate::log_trade_id!(&self.trade_id),
                from = %sender,
                message = %ack.source_msg_class_name,
                "Positive ACK"
            );
            apply_positive_ack(&mut trade, sender, &ack.source_msg_class_name);
        } else {
            let reason = ack.error_message.clone().unwrap_or_default();
            error!(
                trade_id = %crate::log_trade_id!(&self.trade_id),
                from = %sender,
                message = %ack.source_msg_class_name,
                error = %reason,
                "Negative ACK"
            );
            let error = ProtocolError::PeerRejected {
                message: ack.source_msg_class_name.clone(),
                reason,
            };
            trade.error_message = Some(error.to_string());
            match ack.source_msg_class_name.as_str() {
                "DepositRequest" => {
                    trade.set_state(State::PublishDepositTxRequestFailed);
                    trade.mark_failed(error.to_string());
                }
                "InitMultisigRequest" if trade.phase() == Phase::Init && !trade.is_terminal() => {
                    self.stop_timeout();
                    trade.mark_failed(error.to_string());
                }
                _ => {}
            }
        }
        drop(trade);

        if let Err(e) = self
            .services
            .delivery
            .remove_mailbox_message(&envelope.sender_node_address, &ack.source_uid)
            .await
        {
            debug!(error = %e, "Could not remove acknowledged mailbox message");
        }
    }

    /// Poll the daemon for deposit and payout progress and resend unacknowledged messages
    pub async fn sync_with_chain(self: &Arc<Self>) -> ProtocolResult<()> {
        let needs_deposits_confirmed = {
            let mut trade = self.lock().await;
            if trade.is_terminal() {
                return Ok(());
            }
            chain_sync::sync_deposits(&mut trade, &self.services).await?;
            chain_sync::sync_payout(&mut trade, &self.services).await?;
            chain_sync::resend_unacked(&mut trade, &self.services).await;
            trade.state() >= State::DepositTxsConfirmedInBlockchain
                && !trade.process_model.deposits_confirmed_message_sent
        };
        if needs_deposits_confirmed {
            self.send_deposits_confirmed().await;
        }
        Ok(())
    }

    fn subscribe_deposits_confirmed(self: &Arc<Self>) {
        let mut rx = self.state.subscribe();
        let me = self.me.clone();
        let handle = tokio::spawn(async move {
            let reached = rx
                .wait_for(|s| *s >= State::DepositTxsConfirmedInBlockchain)
                .await
                .is_ok();
            if !reached {
                return;
            }
            if let Some(protocol) = me.upgrade() {
                protocol.send_deposits_confirmed().await;
            }
        });
        self.track(handle);
    }

    async fn send_deposits_confirmed(self: &Arc<Self>) {
        let mut trade = self.lock().await;
        if trade.process_model.deposits_confirmed_message_sent || trade.is_terminal() {
            return;
        }
        match tasks::deposit::send_deposits_confirmed(&mut trade, &self.services).await {
            Ok(()) => trade.process_model.deposits_confirmed_message_sent = true,
            Err(e) => warn!(
                trade_id = %crate::log_trade_id!(&self.trade_id),
                error = %e,
                "Failed to send deposits confirmed message, will retry on next poll"
            ),
        }
    }
}

fn apply_positive_ack(trade: &mut Trade, sender: Role, class_name: &str) {
    match class_name {
        "PaymentSentMessage" if trade.is_buyer() => {
            if sender == trade.seller_role() && trade.state() < State::BuyerSawArrivedPaymentSentMsg {
                trade.set_state(State::BuyerSawArrivedPaymentSentMsg);
            }
            let seller = trade.seller_role();
            trade.process_model.payment_sent_message_acked = trade.peer(seller).is_acked(class_name)
                && trade.peer(Role::Arbitrator).is_acked(class_name);
        }
        "PaymentReceivedMessage" if trade.is_seller() => {
            if sender == trade.buyer_role() && trade.state() < State::SellerSawArrivedPaymentReceivedMsg {
                trade.set_state(State::SellerSawArrivedPaymentReceivedMsg);
            }
            let buyer = trade.buyer_role();
            trade.process_model.payment_received_message_acked = trade.peer(buyer).is_acked(class_name)
                && trade.peer(Role::Arbitrator).is_acked(class_name);
        }
        _ => {}
    }
}

impl Drop for TradeProtocol {
    fn drop(&mut self) {
        self.stop_timeout();
        self.release_subscriptions();
    }
}
