//! Trade protocol
//!
//! # Architecture
//!
//! ```text
//! Envelope ──► TradeProtocol::handle_message
//!                 │  dedup (uid) ─► Condition ─► Task, Task, ... ─► ACK
//!                 │                     │              │
//!                 │             retry / defer      fault: NACK, error message,
//!                 │                                 failed if still in Init
//!                 ▼
//!           one tokio Mutex<Trade> per trade, caller awaits a oneshot
//! ```
//!
//! Tasks never talk to the network directly; they go through [`outbox`].

pub mod availability;
pub mod chain_sync;
pub mod condition;
pub mod messages;
pub mod outbox;
pub mod pipeline;
pub mod tasks;
pub mod trade_protocol;

use escrow_types::{KeyRing, NodeAddress, PaymentAccountPayload, PubKeyRing};
use escrow_wallet::{Daemon, TradeWallet};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::ProtocolConfig;
use crate::p2p::MessageDelivery;
use crate::persistence::PersistenceManager;
use crate::services::trade_manager::TradeEvent;

pub use condition::Condition;
pub use pipeline::{PipelineOutcome, Task, TaskContext};
pub use trade_protocol::TradeProtocol;

/// Node-wide collaborators shared by every trade protocol
pub struct ProtocolServices {
    pub config: ProtocolConfig,
    pub key_ring: Arc<KeyRing>,
    pub pub_key_ring: PubKeyRing,
    pub node_address: NodeAddress,
    pub wallet: Arc<dyn TradeWallet>,
    pub daemon: Arc<dyn Daemon>,
    pub delivery: Arc<dyn MessageDelivery>,
    pub persistence: Arc<PersistenceManager>,
    /// Receives the trade fees of both deposits
    pub fee_address: String,
    /// This node's payment account, shared sealed with trade peers
    pub payment_account: PaymentAccountPayload,
    pub events: broadcast::Sender<TradeEvent>,
}

impl ProtocolServices {
    /// Short id of this node's key ring, for logs
    pub fn short_id(&self) -> &str {
        self.pub_key_ring.short_id()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::p2p::LocalNetwork;
    use crate::persistence::{MemoryStore, PersistenceManager};
    use escrow_wallet::{OfflineChain, OfflineWallet};
    use std::time::Duration;

    pub(crate) fn payment_account(label: &str) -> PaymentAccountPayload {
        PaymentAccountPayload {
            id: format!("acct-{label}"),
            payment_method_id: "SEPA".into(),
            holder_name: format!("{label} Example"),
            account_number: format!("DE00{label}"),
        }
    }

    pub(crate) fn test_services_on(
        label: &str,
        chain: Arc<OfflineChain>,
        network: Arc<LocalNetwork>,
    ) -> ProtocolServices {
        let key_ring = Arc::new(KeyRing::generate());
        let config = ProtocolConfig {
            trade_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_millis(50),
            persistence_debounce: Duration::from_millis(10),
            ..ProtocolConfig::default()
        };
        ProtocolServices {
            pub_key_ring: key_ring.pub_key_ring(),
            key_ring,
            node_address: NodeAddress::new(format!("{label}.onion:9999")),
            wallet: Arc::new(OfflineWallet::new(label, chain.clone())),
            daemon: chain,
            delivery: network,
            persistence: PersistenceManager::new(
                Arc::new(MemoryStore::new()),
                config.persistence_debounce,
            ),
            fee_address: "fee-address".into(),
            payment_account: payment_account(label),
            events: broadcast::channel(64).0,
            config,
        }
    }

    pub(crate) fn test_services(label: &str) -> ProtocolServices {
        test_services_on(label, Arc::new(OfflineChain::new()), LocalNetwork::new())
    }
}
