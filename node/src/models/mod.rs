pub mod dispute;
pub mod process_model;
pub mod role;
pub mod state;
pub mod trade;
pub mod trading_peer;

pub use dispute::{Dispute, DisputeReason, DisputeResult, DisputeStatus, SupportType, Winner};
pub use process_model::{MediatedPayout, ProcessModel, ProcessingMessage};
pub use role::{rules_for, side_of, Role, Side, VariantRules};
pub use state::{DisputeState, MediationResultState, PayoutState, Phase, State};
pub use trade::{StateTransition, Trade};
pub use trading_peer::{MultisigStage, TradingPeer};
