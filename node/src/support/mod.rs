//! Dispute support
//!
//! Each support type runs its own [`DisputeManager`] over the trades held by
//! the [`TradeManager`](crate::TradeManager). The mediation track ends in a
//! proposed split both traders must accept; the refund track ends in a payout
//! the arbitrator has already signed. Traders also chat with each other
//! outside any dispute through the [`TraderChatManager`].

pub mod dispute_manager;
pub mod mediation;
pub mod refund;
pub mod trader_chat;

use crate::models::{Role, Trade};
use crate::protocol::messages::Envelope;

pub use dispute_manager::{DisputeDecision, DisputeManager, DisputeTrack};
pub use mediation::MediationManager;
pub use refund::RefundTrack;
pub use trader_chat::TraderChatManager;

/// Role of the party that signed `envelope`, by its key ring on file
pub(crate) fn sender_role(trade: &Trade, envelope: &Envelope) -> Option<Role> {
    [Role::Maker, Role::Taker, Role::Arbitrator]
        .into_iter()
        .filter(|role| *role != trade.role)
        .find(|role| trade.peer(*role).pub_key_ring.as_ref() == Some(&envelope.sender_pub_key_ring))
}
