use serde::{Deserialize, Serialize};

use crate::{ChunkConfig, ChunkError};

/// Logical message type an envelope belongs to. Reassembly is keyed by it,
/// so an offer and a lobby message from the same peer never mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    #[serde(rename = "offer")]
    Offer,
    #[serde(rename = "answer")]
    Answer,
    #[serde(rename = "lobby-msg")]
    LobbyMessage,
}

/// One bounded fragment of a larger message.
///
/// Wire form: `{ "t": "offer", "idx": 0, "total": 6, "data": "v=0\r\n..." }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEnvelope {
    #[serde(rename = "t")]
    pub kind: EnvelopeKind,
    #[serde(rename = "idx")]
    pub index: u32,
    pub total: u32,
    pub data: String,
}

impl ChunkEnvelope {
    pub fn validate(&self, config: &ChunkConfig) -> Result<(), ChunkError> {
        if self.total == 0 {
            return Err(ChunkError::Malformed("chunk total cannot be zero"));
        }
        if self.total > config.max_chunks {
            return Err(ChunkError::Malformed("chunk total exceeds limit"));
        }
        if self.index >= self.total {
            return Err(ChunkError::Malformed("chunk index out of range"));
        }
        // A lone character wider than the budget is the only permitted overrun.
        if self.data.len() > config.max_envelope_bytes.max(1) && self.data.chars().nth(1).is_some() {
            return Err(ChunkError::Oversized(self.data.len()));
        }
        Ok(())
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, ChunkError> {
        serde_json::to_vec(self).map_err(|err| ChunkError::Wire(err.to_string()))
    }

    pub fn from_wire(bytes: &[u8], config: &ChunkConfig) -> Result<Self, ChunkError> {
        let envelope: ChunkEnvelope =
            serde_json::from_slice(bytes).map_err(|err| ChunkError::Wire(err.to_string()))?;
        envelope.validate(config)?;
        Ok(envelope)
    }
}

/// Split `payload` into envelopes of at most `max_envelope_bytes` data bytes.
///
/// Slices end on UTF-8 boundaries so each `data` stays a valid JSON string;
/// ASCII payloads produce exactly `ceil(len / max)` envelopes. An empty
/// payload still yields one envelope with `total == 1`.
pub fn encode(
    kind: EnvelopeKind,
    payload: &str,
    max_envelope_bytes: usize,
) -> Result<Vec<ChunkEnvelope>, ChunkError> {
    let slices = split_on_char_boundaries(payload, max_envelope_bytes.max(1));
    let total = u32::try_from(slices.len()).map_err(|_| ChunkError::TooManyChunks)?;
    Ok(slices
        .into_iter()
        .zip(0..total)
        .map(|(data, index)| ChunkEnvelope {
            kind,
            index,
            total,
            data: data.to_string(),
        })
        .collect())
}

/// Rebuild a payload from a complete envelope set, ordered by index.
pub fn decode(envelopes: &[ChunkEnvelope], expected_total: u32) -> Result<String, ChunkError> {
    if expected_total == 0 {
        return Err(ChunkError::Malformed("chunk total cannot be zero"));
    }
    let mut parts: Vec<Option<&str>> = vec![None; expected_total as usize];
    for envelope in envelopes {
        if envelope.total != expected_total {
            return Err(ChunkError::Malformed("chunk total changed for message"));
        }
        let slot = parts
            .get_mut(envelope.index as usize)
            .ok_or(ChunkError::Malformed("chunk index out of range"))?;
        *slot = Some(envelope.data.as_str());
    }
    join_parts(&parts)
}

pub(crate) fn join_parts<S: AsRef<str>>(parts: &[Option<S>]) -> Result<String, ChunkError> {
    let missing = parts.iter().filter(|part| part.is_none()).count();
    if missing > 0 {
        return Err(ChunkError::Incomplete {
            expected: parts.len() as u32,
            missing: missing as u32,
        });
    }
    let len = parts
        .iter()
        .flatten()
        .map(|part| part.as_ref().len())
        .sum();
    let mut combined = String::with_capacity(len);
    for part in parts.iter().flatten() {
        combined.push_str(part.as_ref());
    }
    Ok(combined)
}

fn split_on_char_boundaries(payload: &str, max: usize) -> Vec<&str> {
    if payload.is_empty() {
        return vec![""];
    }
    let mut slices = Vec::with_capacity(payload.len().div_ceil(max));
    let mut rest = payload;
    while !rest.is_empty() {
        let mut end = max.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(end);
        slices.push(head);
        rest = tail;
    }
    slices
}
