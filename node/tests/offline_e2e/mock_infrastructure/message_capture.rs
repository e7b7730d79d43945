//! Drop filters that lose or hold back selected messages in transit

use escrow_node::p2p::local_network::DropFilter;
use escrow_node::protocol::messages::{Envelope, Message};
use escrow_types::NodeAddress;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Lose the first ACK for `class_name` that `sender` sends to `recipient`;
/// later ones pass
pub fn drop_first_ack(
    sender: NodeAddress,
    recipient: NodeAddress,
    class_name: &'static str,
) -> DropFilter {
    let dropped = AtomicBool::new(false);
    Box::new(move |peer, envelope| {
        let is_target = peer == &recipient
            && envelope.sender_node_address == sender
            && matches!(&envelope.message, Message::Ack(ack) if ack.source_msg_class_name == class_name);
        is_target && !dropped.swap(true, Ordering::SeqCst)
    })
}

/// Holds back messages of the given classes addressed to one node, so a test
/// can hand them over later as a mailbox batch in any order
#[derive(Clone, Default)]
pub struct MessageCapture {
    held: Arc<Mutex<Vec<Envelope>>>,
}

impl MessageCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(&self, recipient: NodeAddress, classes: &'static [&'static str]) -> DropFilter {
        let held = Arc::clone(&self.held);
        Box::new(move |peer, envelope| {
            if peer != &recipient || !classes.contains(&envelope.message.class_name()) {
                return false;
            }
            held.lock().unwrap().push(envelope.clone());
            true
        })
    }

    /// Held messages in arrival order, resends with a seen uid removed
    pub fn take(&self) -> Vec<Envelope> {
        let mut seen = HashSet::new();
        self.held
            .lock()
            .unwrap()
            .drain(..)
            .filter(|e| seen.insert(e.message.uid().to_string()))
            .collect()
    }

    pub fn classes(&self) -> Vec<&'static str> {
        self.held
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.message.class_name())
            .collect()
    }
}
