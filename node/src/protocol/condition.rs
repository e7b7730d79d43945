//! Preconditions a message or local action must meet before its tasks run

use tracing::{info, warn};

use super::messages::Envelope;
use crate::error::{ProtocolError, ProtocolResult};
use crate::models::{Phase, Role, State, Trade};

/// Checks applied in order: trade id, sender, local role, phase, state, confirm.
///
/// Trade id and sender faults reject the message outright. Phase and state
/// faults mean the message may just be early.
#[derive(Default)]
pub struct Condition {
    phases: Vec<Phase>,
    min_phase: Option<Phase>,
    states: Vec<State>,
    senders: Vec<Role>,
    confirm: bool,
    ignore_when: Option<fn(&Trade) -> bool>,
}

impl Condition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(mut self, phases: &[Phase]) -> Self {
        self.phases = phases.to_vec();
        self
    }

    pub fn min_phase(mut self, phase: Phase) -> Self {
        self.min_phase = Some(phase);
        self
    }

    pub fn state(mut self, states: &[State]) -> Self {
        self.states = states.to_vec();
        self
    }

    /// Roles allowed to send the message
    pub fn from(mut self, senders: &[Role]) -> Self {
        self.senders = senders.to_vec();
        self
    }

    /// Require the variant's confirm rule to hold
    pub fn confirm_permitted(mut self) -> Self {
        self.confirm = true;
        self
    }

    /// Accept and ACK without running any task when `predicate` holds
    pub fn ignore_when(mut self, predicate: fn(&Trade) -> bool) -> Self {
        self.ignore_when = Some(predicate);
        self
    }

    pub fn should_ignore(&self, trade: &Trade) -> bool {
        self.ignore_when.map(|p| p(trade)).unwrap_or(false)
    }

    /// Run every check. Returns the sender's role for messages.
    pub fn check(&self, trade: &mut Trade, envelope: Option<&Envelope>) -> ProtocolResult<Option<Role>> {
        let sender = match envelope {
            Some(envelope) => {
                if envelope.message.trade_id() != trade.id {
                    return Err(ProtocolError::TradeIdMismatch {
                        expected: trade.id.clone(),
                        actual: envelope.message.trade_id().to_string(),
                    });
                }
                Some(self.identify_sender(trade, envelope)?)
            }
            None => None,
        };

        let phase = trade.phase();
        if !self.phases.is_empty() && !self.phases.contains(&phase) {
            return Err(ProtocolError::UnexpectedPhase {
                expected: join(&self.phases),
                actual: phase,
            });
        }
        if let Some(min) = self.min_phase {
            if phase < min {
                return Err(ProtocolError::UnexpectedPhase {
                    expected: format!("{min} or later"),
                    actual: phase,
                });
            }
        }
        let state = trade.state();
        if !self.states.is_empty() && !self.states.contains(&state) {
            return Err(ProtocolError::UnexpectedState {
                expected: join(&self.states),
                actual: state,
            });
        }
        if self.confirm && !trade.rules().confirm_permitted(trade) {
            return Err(ProtocolError::NotPermitted(format!(
                "confirming is not allowed while dispute state is {}",
                trade.dispute_state
            )));
        }
        Ok(sender)
    }

    /// Match the envelope key against the allowed parties. A party whose key is
    /// still unknown is bound to the sender on first contact.
    fn identify_sender(&self, trade: &mut Trade, envelope: &Envelope) -> ProtocolResult<Role> {
        let reject = |reason: String| ProtocolError::UnexpectedSender {
            sender: envelope.sender_node_address.clone(),
            reason,
        };

        let known = self.senders.iter().copied().find(|role| {
            trade.peer(*role).pub_key_ring.as_ref() == Some(&envelope.sender_pub_key_ring)
        });
        if let Some(role) = known {
            if trade.peer(role).node_address.as_ref() != Some(&envelope.sender_node_address) {
                info!(
                    trade_id = %crate::log_trade_id!(&trade.id),
                    role = %role,
                    address = %crate::log_address!(envelope.sender_node_address.as_str()),
                    "Peer node address changed"
                );
                trade.peer_mut(role).node_address = Some(envelope.sender_node_address.clone());
            }
            return Ok(role);
        }

        let own_key = trade.self_peer().pub_key_ring.clone();
        if own_key.as_ref() == Some(&envelope.sender_pub_key_ring) {
            return Err(reject("message signed with our own key".to_string()));
        }

        let unknown: Vec<Role> = self
            .senders
            .iter()
            .copied()
            .filter(|role| *role != trade.role && trade.peer(*role).pub_key_ring.is_none())
            .collect();
        let candidate = match unknown.as_slice() {
            [] => None,
            [only] => Some(*only),
            many => many.iter().copied().find(|role| {
                trade.peer(*role).node_address.as_ref() == Some(&envelope.sender_node_address)
                    || trade.process_model.temp_peer_node_address.as_ref()
                        == Some(&envelope.sender_node_address)
            }),
        };

        match candidate {
            Some(role) => {
                warn!(
                    trade_id = %crate::log_trade_id!(&trade.id),
                    role = %role,
                    key = %envelope.sender_pub_key_ring.short_id(),
                    "Binding unknown peer key on first contact"
                );
                let peer = trade.peer_mut(role);
                peer.pub_key_ring = Some(envelope.sender_pub_key_ring.clone());
                peer.node_address = Some(envelope.sender_node_address.clone());
                Ok(role)
            }
            None => Err(reject(format!(
                "key {} does not belong to any of [{}]",
                envelope.sender_pub_key_ring.short_id(),
                join(&self.senders)
            ))),
        }
    }
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
