use std::time::Duration;

use signal_chunk::ChunkConfig;

use crate::peer::RtcSettings;
use crate::signaling::SignalingConfig;
use crate::transport::DEFAULT_DEVICE_PREFIX;

pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_ANSWER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_PENDING: usize = 256;
pub const DEFAULT_CHANNEL_LABEL: &str = "motion-data";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub log_filter: String,
    pub device_prefix: String,
    pub chunk: ChunkConfig,
    pub scan_timeout: Duration,
    pub answer_timeout: Duration,
    pub grace_period: Duration,
    /// Bound on queued outbound messages and early ICE candidates per peer.
    pub max_pending: usize,
    pub ice_servers: Vec<String>,
    pub channel_label: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_filter: "info,motion_bridge=debug".into(),
            device_prefix: DEFAULT_DEVICE_PREFIX.into(),
            chunk: ChunkConfig::default(),
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            answer_timeout: DEFAULT_ANSWER_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            max_pending: DEFAULT_MAX_PENDING,
            ice_servers: Vec::new(),
            channel_label: DEFAULT_CHANNEL_LABEL.into(),
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok());
        config.chunk = ChunkConfig::from_env();
        config
    }

    /// Build from an arbitrary key lookup; unparsable values fall back to
    /// the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .map(Duration::from_millis)
                .unwrap_or(default)
        };
        let log_filter = lookup("RUST_LOG").unwrap_or(defaults.log_filter);
        let device_prefix = lookup("MOTION_BRIDGE_DEVICE_PREFIX")
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.device_prefix);
        let scan_timeout = millis("MOTION_BRIDGE_SCAN_TIMEOUT_MS", defaults.scan_timeout);
        let answer_timeout = millis("MOTION_BRIDGE_ANSWER_TIMEOUT_MS", defaults.answer_timeout);
        let grace_period = millis("MOTION_BRIDGE_GRACE_PERIOD_MS", defaults.grace_period);
        let max_pending = lookup("MOTION_BRIDGE_MAX_PENDING")
            .and_then(|v| v.parse().ok())
            .filter(|v: &usize| *v > 0)
            .unwrap_or(defaults.max_pending);
        let ice_servers = lookup("MOTION_BRIDGE_ICE_SERVERS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let channel_label = lookup("MOTION_BRIDGE_CHANNEL_LABEL")
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.channel_label);
        Self {
            log_filter,
            device_prefix,
            chunk: defaults.chunk,
            scan_timeout,
            answer_timeout,
            grace_period,
            max_pending,
            ice_servers,
            channel_label,
        }
    }

    pub fn signaling(&self) -> SignalingConfig {
        SignalingConfig {
            chunk: self.chunk,
            scan_timeout: self.scan_timeout,
            answer_timeout: self.answer_timeout,
        }
    }

    pub fn rtc(&self) -> RtcSettings {
        RtcSettings {
            ice_servers: self.ice_servers.clone(),
            channel_label: self.channel_label.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = BridgeConfig::from_lookup(|_| None);
        assert_eq!(config.device_prefix, "Motion-");
        assert_eq!(config.scan_timeout, Duration::from_secs(15));
        assert_eq!(config.answer_timeout, Duration::from_secs(30));
        assert_eq!(config.grace_period, Duration::from_secs(3));
        assert_eq!(config.max_pending, 256);
        assert!(config.ice_servers.is_empty());
        assert_eq!(config.chunk.max_envelope_bytes, 180);
    }

    #[test]
    fn overrides_and_bad_values() {
        let config = BridgeConfig::from_lookup(lookup_from(&[
            ("MOTION_BRIDGE_SCAN_TIMEOUT_MS", "2500"),
            ("MOTION_BRIDGE_GRACE_PERIOD_MS", "soon"),
            ("MOTION_BRIDGE_MAX_PENDING", "0"),
            (
                "MOTION_BRIDGE_ICE_SERVERS",
                "stun:stun.l.google.com:19302, ,turn:relay.example:3478",
            ),
            ("MOTION_BRIDGE_CHANNEL_LABEL", "lanes"),
        ]));
        assert_eq!(config.scan_timeout, Duration::from_millis(2500));
        assert_eq!(config.grace_period, DEFAULT_GRACE_PERIOD);
        assert_eq!(config.max_pending, DEFAULT_MAX_PENDING);
        assert_eq!(
            config.ice_servers,
            vec!["stun:stun.l.google.com:19302", "turn:relay.example:3478"]
        );
        assert_eq!(config.rtc().channel_label, "lanes");
    }
}
