//! Chunked envelopes for carrying negotiation payloads over links whose
//! single-write size is far smaller than the message.
//!
//! [`codec`] splits and joins payloads; [`reassembly`] accumulates envelopes
//! that may arrive reordered or duplicated and hands back complete payloads.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

pub mod codec;
pub mod reassembly;

pub use codec::{ChunkEnvelope, EnvelopeKind, decode, encode};
pub use reassembly::{GcEvent, GcReason, ReassemblyBuffer};

pub const DEFAULT_MAX_ENVELOPE_BYTES: usize = 180;
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_INFLIGHT: usize = 64;
pub const DEFAULT_MAX_CHUNKS: u32 = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkConfig {
    /// Upper bound on `data` bytes carried by one envelope.
    pub max_envelope_bytes: usize,
    /// Idle time after which a partial message is dropped.
    pub reassembly_timeout: Duration,
    pub max_inflight: usize,
    /// Largest `total` a remote may announce; bounds the slots one entry allocates.
    pub max_chunks: u32,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_envelope_bytes: DEFAULT_MAX_ENVELOPE_BYTES,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            max_chunks: DEFAULT_MAX_CHUNKS,
        }
    }
}

impl ChunkConfig {
    pub fn from_env() -> Self {
        let max_envelope_bytes = parse_u64_env(
            "MOTION_BRIDGE_ENVELOPE_BYTES",
            DEFAULT_MAX_ENVELOPE_BYTES as u64,
            1,
        ) as usize;
        let timeout_ms = parse_u64_env(
            "MOTION_BRIDGE_REASSEMBLY_TIMEOUT_MS",
            DEFAULT_REASSEMBLY_TIMEOUT.as_millis() as u64,
            1,
        );
        Self {
            max_envelope_bytes,
            reassembly_timeout: Duration::from_millis(timeout_ms),
            max_inflight: DEFAULT_MAX_INFLIGHT,
            max_chunks: DEFAULT_MAX_CHUNKS,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("message incomplete: {missing} of {expected} chunks missing")]
    Incomplete { expected: u32, missing: u32 },
    #[error("envelope malformed: {0}")]
    Malformed(&'static str),
    #[error("envelope data too large: {0} bytes")]
    Oversized(usize),
    #[error("message needs more than u32::MAX envelopes")]
    TooManyChunks,
    #[error("envelope wire format: {0}")]
    Wire(String),
}

fn parse_u64_env(var: &str, default: u64, min: u64) -> u64 {
    match std::env::var(var) {
        Ok(value) => match value.trim().parse::<u64>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                warn!(
                    target = "signal_chunk",
                    var, parsed, min, default, "chunk config below minimum; using default"
                );
                default
            }
            Err(err) => {
                warn!(
                    target = "signal_chunk",
                    var,
                    error = %err,
                    default,
                    "failed to parse chunk config from env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}
