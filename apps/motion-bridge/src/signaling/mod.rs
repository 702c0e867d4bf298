//! Offer/answer exchange over the short-range link.
//!
//! The responder advertises, waits for a complete offer, and notifies the
//! answer back; the initiator scans, writes its offer, and waits for the
//! answer. Payloads travel as chunk envelopes and are reassembled per role
//! and envelope kind.

use std::time::Duration;

use async_trait::async_trait;
use signal_chunk::{ChunkConfig, ChunkError};
use thiserror::Error;

use crate::transport::{SessionId, TransportError};

mod service;

pub use service::SignalingService;

/// Reassembly key for envelopes the responder receives from its central.
pub const RESPONDER_PEER_KEY: &str = "central";
/// Reassembly key for envelopes the initiator receives from the advertiser.
pub const INITIATOR_PEER_KEY: &str = "peripheral";

#[derive(Debug, Clone, Copy)]
pub struct SignalingConfig {
    pub chunk: ChunkConfig,
    pub scan_timeout: Duration,
    pub answer_timeout: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            chunk: ChunkConfig::default(),
            scan_timeout: crate::config::DEFAULT_SCAN_TIMEOUT,
            answer_timeout: crate::config::DEFAULT_ANSWER_TIMEOUT,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("failed to create offer: {0}")]
    CreateOffer(String),
    #[error("failed to create answer: {0}")]
    CreateAnswer(String),
    #[error("failed to apply answer: {0}")]
    ApplyAnswer(String),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
}

/// The WebRTC side of a handshake, as seen by the signaling flow.
#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn create_offer_with_data_channel(&self) -> Result<String, NegotiationError>;
    async fn accept_offer_and_create_answer(&self, offer: &str) -> Result<String, NegotiationError>;
    async fn set_remote_answer(&self, answer: &str) -> Result<(), NegotiationError>;
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("discovery failed: {0}")]
    Discovery(#[source] TransportError),
    #[error("short-range transport: {0}")]
    Transport(#[from] TransportError),
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("no answer within {0:?}")]
    AnswerTimeout(Duration),
    #[error("short-range link closed before the answer arrived")]
    LinkClosed,
    #[error("chunk encoding: {0}")]
    Chunk(#[from] ChunkError),
    #[error("no short-range link is active")]
    NotConnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Advertising { session_id: SessionId, name: String },
    CentralConnected { address: String },
    CentralDisconnected { address: String },
    PeripheralConnected { name: String },
    PeripheralDisconnected,
    OfferReceived { len: usize },
    AnswerSent { envelopes: usize },
    AnswerApplied,
    LobbyMessage { text: String },
    HandshakeFailed { reason: String },
}
