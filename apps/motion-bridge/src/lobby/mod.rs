//! Session supervision on top of the peer manager: who is in the lobby,
//! what state their connection is in, and where application messages go.

use presence_store::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::time::Instant;

use crate::motion::MotionEvent;
use crate::peer::{PeerConnectionState, PeerError, PeerId};

mod controller;
mod presence;

pub use controller::LobbySessionController;
pub use presence::{PresenceSignal, SignalKind};

pub const PLAYER_INFO_TYPE: &str = "player-info";
pub const MOTION_TYPE: &str = "motion";

#[derive(Debug, Error)]
pub enum LobbyError {
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to encode lobby message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("already joined a lobby session")]
    AlreadyJoined,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerEntry {
    pub state: PeerConnectionState,
    pub display_name: Option<String>,
    pub ready: bool,
    pub last_seen: Instant,
}

impl PeerEntry {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            state: PeerConnectionState::New,
            display_name: None,
            ready: false,
            last_seen: now,
        }
    }
}

/// Application message carried over a data channel: a JSON object whose
/// string `type` picks the handler branch. Other fields pass through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LobbyMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl LobbyMessage {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn player_info(name: &str, ready: bool) -> Self {
        Self::new(PLAYER_INFO_TYPE)
            .with("name", name)
            .with("ready", ready)
    }

    /// Motion event fields flattened next to `type: "motion"`.
    pub fn motion(event: &MotionEvent) -> Result<Self, serde_json::Error> {
        let mut message = Self::new(MOTION_TYPE);
        if let Value::Object(fields) = serde_json::to_value(event)? {
            message.fields = fields;
        }
        Ok(message)
    }

    /// `None` for anything that is not a JSON object with a string `type`.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// Single sink for application messages; types it does not know are its
/// own to ignore.
pub trait LobbyMessageHandler: Send + Sync {
    fn handle(&self, from: &PeerId, message: &LobbyMessage);
}

impl<F> LobbyMessageHandler for F
where
    F: Fn(&PeerId, &LobbyMessage) + Send + Sync,
{
    fn handle(&self, from: &PeerId, message: &LobbyMessage) {
        self(from, message)
    }
}

/// How this device shows up in the presence list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub name: String,
    #[serde(default)]
    pub ready: bool,
}
