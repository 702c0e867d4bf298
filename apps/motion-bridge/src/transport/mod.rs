//! Short-range bootstrap link (BLE in the field): one advertiser, one or
//! more scanners, byte writes and notifications with no delivery guarantee.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod loopback;

pub use loopback::{LinkFaults, LoopbackRadio};

pub const DEFAULT_DEVICE_PREFIX: &str = "Motion-";
/// Largest attribute value a single GATT write or notification can carry.
pub const MAX_WRITE_BYTES: usize = 512;
pub const SESSION_ID_LEN: usize = 6;
const MAX_SESSION_ID_LEN: usize = 16;
const SESSION_ID_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// GATT layout of the signaling service. The central writes envelopes to
/// RX and subscribes to notifications on TX through its CCCD.
pub mod gatt {
    pub const SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
    pub const RX_CHARACTERISTIC_UUID: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";
    pub const TX_CHARACTERISTIC_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";
    pub const CCCD_UUID: &str = "00002902-0000-1000-8000-00805f9b34fb";
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),
    #[error("no advertiser for session {session_id} within {waited_ms} ms")]
    ScanTimeout { session_id: String, waited_ms: u64 },
    #[error("{0} is already being advertised")]
    AlreadyAdvertising(String),
    #[error("no connected peer on the short-range link")]
    NotConnected,
    #[error("write of {len} bytes exceeds the {max}-byte link limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("short-range radio error: {0}")]
    Radio(String),
}

/// Short alphanumeric token embedded in the advertised name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        let trimmed = raw.trim();
        let valid = !trimmed.is_empty()
            && trimmed.len() <= MAX_SESSION_ID_LEN
            && trimmed.chars().all(|c| c.is_ascii_alphanumeric());
        if !valid {
            return Err(TransportError::InvalidSessionId(raw.to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    /// Six characters, skipping the easily confused `0/O` and `1/I`.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let id = (0..SESSION_ID_LEN)
            .map(|_| SESSION_ID_ALPHABET[rng.gen_range(0..SESSION_ID_ALPHABET.len())] as char)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn advertised_name(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertiserEvent {
    CentralConnected { address: String },
    CentralDisconnected { address: String },
    Write(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralEvent {
    Notification(Bytes),
    Disconnected,
}

/// Advertiser-side handle: push notifications to the connected central.
#[async_trait]
pub trait PeripheralLink: Send + Sync {
    fn advertised_name(&self) -> &str;
    async fn notify(&self, bytes: Bytes) -> Result<(), TransportError>;
    /// Stop advertising and close the GATT server.
    async fn stop(&self);
}

/// Scanner-side handle: write to the peripheral it connected to.
#[async_trait]
pub trait CentralLink: Send + Sync {
    fn peer_address(&self) -> &str;
    async fn write(&self, bytes: Bytes) -> Result<(), TransportError>;
    async fn disconnect(&self);
}

pub struct AdvertiserSession {
    pub link: Arc<dyn PeripheralLink>,
    pub events: mpsc::UnboundedReceiver<AdvertiserEvent>,
}

pub struct CentralSession {
    pub link: Arc<dyn CentralLink>,
    /// Advertised name of the peripheral that matched.
    pub name: String,
    pub events: mpsc::UnboundedReceiver<CentralEvent>,
}

#[async_trait]
pub trait ShortRangeTransport: Send + Sync {
    async fn start_advertising(
        &self,
        session_id: &SessionId,
    ) -> Result<AdvertiserSession, TransportError>;

    /// Scan for `"{prefix}{session_id}"`, connect to the first match and
    /// subscribe to its notifications. The scan is stopped on every exit path.
    async fn scan_and_connect(
        &self,
        session_id: &SessionId,
        timeout: Duration,
    ) -> Result<CentralSession, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_normalized() {
        let id = SessionId::parse(" ab12cd ").expect("valid");
        assert_eq!(id.as_str(), "AB12CD");
        assert_eq!(id.advertised_name(DEFAULT_DEVICE_PREFIX), "Motion-AB12CD");
        assert!(SessionId::parse("").is_err());
        assert!(SessionId::parse("ab-12").is_err());
        assert!("X".repeat(17).parse::<SessionId>().is_err());
    }

    #[test]
    fn generated_ids_are_six_unambiguous_chars() {
        for _ in 0..50 {
            let id = SessionId::generate();
            assert_eq!(id.as_str().len(), SESSION_ID_LEN);
            assert!(!id.as_str().contains(['0', 'O', '1', 'I']));
            assert_eq!(SessionId::parse(id.as_str()).expect("round trip"), id);
        }
    }
}
