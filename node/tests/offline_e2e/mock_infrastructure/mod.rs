//! Mock infrastructure for the offline trade tests
//!
//! - TradeNetwork: maker, taker and arbitrator nodes over the offline chain
//! - MessageCapture: drop filters for lost and reordered messages

pub mod message_capture;
pub mod trade_network;

pub use message_capture::*;
pub use trade_network::*;
