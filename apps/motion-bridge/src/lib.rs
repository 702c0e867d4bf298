//! Device-to-device bridge: a short-range radio link carries the WebRTC
//! offer/answer exchange, after which peers talk over data channels and a
//! lobby controller tracks who is connected.

pub mod config;
pub mod lobby;
pub mod motion;
pub mod peer;
pub mod signaling;
pub mod telemetry;
pub mod transport;

pub use config::BridgeConfig;
pub use lobby::{LobbyMessage, LobbySessionController, PeerEntry, PlayerProfile};
pub use motion::MotionEvent;
pub use peer::{PeerConnectionManager, PeerConnectionState, PeerEvent, PeerId};
pub use signaling::{SignalingError, SignalingEvent, SignalingService};
pub use transport::{SessionId, ShortRangeTransport};
