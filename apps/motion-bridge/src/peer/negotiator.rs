use async_trait::async_trait;

use super::{PeerConnectionManager, PeerError, PeerId};
use crate::signaling::{NegotiationError, Negotiator};

/// Binds the short-range signaling flow to one peer of a manager.
#[derive(Clone)]
pub struct PeerNegotiator {
    manager: PeerConnectionManager,
    peer_id: PeerId,
}

impl PeerNegotiator {
    pub fn new(manager: PeerConnectionManager, peer_id: impl Into<PeerId>) -> Self {
        Self {
            manager,
            peer_id: peer_id.into(),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }
}

#[async_trait]
impl Negotiator for PeerNegotiator {
    async fn create_offer_with_data_channel(&self) -> Result<String, NegotiationError> {
        self.manager
            .create_connection_and_offer(&self.peer_id)
            .await
            .map_err(|err| NegotiationError::CreateOffer(err.to_string()))
    }

    async fn accept_offer_and_create_answer(&self, offer: &str) -> Result<String, NegotiationError> {
        self.manager
            .handle_offer_and_create_answer(&self.peer_id, offer)
            .await
            .map_err(|err| match err {
                PeerError::InvalidDescription(reason) => NegotiationError::InvalidDescription(reason),
                other => NegotiationError::CreateAnswer(other.to_string()),
            })
    }

    async fn set_remote_answer(&self, answer: &str) -> Result<(), NegotiationError> {
        self.manager
            .handle_answer(&self.peer_id, answer)
            .await
            .map_err(|err| match err {
                PeerError::InvalidDescription(reason) => NegotiationError::InvalidDescription(reason),
                other => NegotiationError::ApplyAnswer(other.to_string()),
            })
    }
}
