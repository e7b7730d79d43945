//! Mediation and refund tracks, and the traders' own chat

pub mod mediation_refund_test;
pub mod trader_chat_test;
