//! WebRTC peer connections keyed by peer id, with per-peer queues that
//! hold outbound messages until the data channel opens and remote ICE
//! candidates until the remote description is applied.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod loopback;
pub mod manager;
pub mod negotiator;
pub mod webrtc_link;

pub use loopback::{LoopbackLinkFactory, LoopbackNetwork};
pub use manager::PeerConnectionManager;
pub use negotiator::PeerNegotiator;
pub use webrtc_link::{RtcSettings, WebRtcLinkFactory};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// Failed and closed connections are never revived.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }
}

/// Candidate in the browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("no connection for peer {0}")]
    UnknownPeer(PeerId),
    #[error("pending queue for peer {peer_id} is full ({limit} entries)")]
    QueueFull { peer_id: PeerId, limit: usize },
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("peer link error: {0}")]
    Link(String),
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
}

/// Raw event from one link; the manager tags it with the link generation.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    StateChanged(PeerConnectionState),
    ChannelOpen,
    ChannelClosed,
    Message(String),
    LocalCandidate(IceCandidate),
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    StateChanged {
        peer_id: PeerId,
        state: PeerConnectionState,
    },
    ChannelOpen {
        peer_id: PeerId,
    },
    Message {
        peer_id: PeerId,
        text: String,
    },
    LocalCandidate {
        peer_id: PeerId,
        candidate: IceCandidate,
    },
}

/// One peer connection plus its single ordered, reliable data channel.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create the data channel and a complete offer.
    async fn create_offer(&self) -> Result<String, PeerError>;
    /// Apply a remote offer and return the answer.
    async fn accept_offer(&self, offer: &str) -> Result<String, PeerError>;
    async fn apply_answer(&self, answer: &str) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError>;
    async fn send_text(&self, text: &str) -> Result<(), PeerError>;
    async fn close(&self);
}

#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    async fn open(
        &self,
        peer_id: &PeerId,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, PeerError>;
}
