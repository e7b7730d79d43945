//! Offer availability
//!
//! Before registering a trade the taker asks the maker whether the offer is
//! still open at the taker's price and amount. The request goes direct; an
//! offline maker means the offer cannot be taken now.

use escrow_types::{Offer, PubKeyRing};
use std::collections::HashMap;
use std::sync::{Mutex as StdMutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::messages::{
    AvailabilityResult, Envelope, MessageHeader, OfferAvailabilityRequest, OfferAvailabilityResponse,
};
use super::outbox::envelope;
use super::ProtocolServices;
use crate::error::{ProtocolError, ProtocolResult};

struct PendingRequest {
    maker_pub_key_ring: PubKeyRing,
    reply: oneshot::Sender<AvailabilityResult>,
}

/// Taker side: availability requests waiting for the maker's answer
#[derive(Default)]
pub struct AvailabilityRequests {
    pending: StdMutex<HashMap<String, PendingRequest>>,
}

impl AvailabilityRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Ask the maker of `offer` whether it can be taken for `amount`
    pub async fn request(
        &self,
        services: &ProtocolServices,
        offer: &Offer,
        amount: u64,
    ) -> ProtocolResult<AvailabilityResult> {
        let request = OfferAvailabilityRequest {
            header: MessageHeader::new(&offer.id, &services.node_address),
            offer_id: offer.id.clone(),
            takers_trade_price: offer.price,
            trade_amount: amount,
        };
        let uid = request.header.uid.clone();
        let (reply, answer) = oneshot::channel();
        self.pending().insert(
            uid.clone(),
            PendingRequest {
                maker_pub_key_ring: offer.maker_pub_key_ring.clone(),
                reply,
            },
        );

        debug!(offer_id = %crate::log_trade_id!(&offer.id), "Checking offer availability");
        if let Err(e) = services
            .delivery
            .send_direct(&offer.maker_node_address, &offer.maker_pub_key_ring, envelope(services, request))
            .await
        {
            self.pending().remove(&uid);
            return Err(e.into());
        }

        let limit = services.config.trade_timeout;
        match timeout(limit, answer).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(ProtocolError::Internal("availability request dropped".to_string())),
            Err(_) => {
                self.pending().remove(&uid);
                Err(ProtocolError::Timeout {
                    secs: limit.as_secs(),
                })
            }
        }
    }

    /// Hand a response to the request it answers. Responses not signed by
    /// the offer's maker are ignored.
    pub fn on_response(&self, envelope: &Envelope, response: &OfferAvailabilityResponse) {
        let mut pending = self.pending();
        match pending.get(&response.request_uid) {
            Some(request) if request.maker_pub_key_ring == envelope.sender_pub_key_ring => {}
            Some(_) => {
                warn!(
                    offer_id = %crate::log_trade_id!(&response.offer_id),
                    sender = %envelope.sender_node_address,
                    "Availability response not from the maker"
                );
                return;
            }
            None => {
                debug!(
                    offer_id = %crate::log_trade_id!(&response.offer_id),
                    "Availability response for no pending request"
                );
                return;
            }
        }
        if let Some(request) = pending.remove(&response.request_uid) {
            let _ = request.reply.send(response.result);
        }
    }
}

/// Maker side: can `offer` serve `request`
pub fn evaluate(offer: &Offer, request: &OfferAvailabilityRequest) -> AvailabilityResult {
    if request.takers_trade_price != offer.price {
        return AvailabilityResult::PriceMismatch;
    }
    if !offer.is_amount_in_range(request.trade_amount) {
        return AvailabilityResult::AmountOutOfRange;
    }
    AvailabilityResult::Available
}

/// Maker side: answer `request` to its sender
pub async fn respond(
    services: &ProtocolServices,
    source: &Envelope,
    request: &OfferAvailabilityRequest,
    result: AvailabilityResult,
) {
    info!(
        offer_id = %crate::log_trade_id!(&request.offer_id),
        result = %result,
        "Answering availability request"
    );
    let response = OfferAvailabilityResponse {
        header: MessageHeader::new(&request.offer_id, &services.node_address),
        offer_id: request.offer_id.clone(),
        request_uid: request.header.uid.clone(),
        result,
    };
    if let Err(e) = services
        .delivery
        .send_direct(
            &source.sender_node_address,
            &source.sender_pub_key_ring,
            envelope(services, response),
        )
        .await
    {
        warn!(
            offer_id = %crate::log_trade_id!(&request.offer_id),
            error = %e,
            "Availability response not sent"
        );
    }
}
