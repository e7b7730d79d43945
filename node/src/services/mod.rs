//! Node-level services built on top of the trade protocol

pub mod trade_manager;
