use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, warn};

use crate::ChunkConfig;
use crate::codec::{self, ChunkEnvelope, EnvelopeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcReason {
    Timeout,
    Capacity,
    /// The link the entry arrived on was replaced or closed.
    Forgotten,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcEvent {
    pub peer_key: String,
    pub kind: EnvelopeKind,
    pub reason: GcReason,
}

#[derive(Debug)]
struct ReassemblyEntry {
    total: u32,
    parts: Vec<Option<String>>,
    filled: u32,
    created_at: Instant,
    updated_at: Instant,
}

impl ReassemblyEntry {
    fn new(total: u32, now: Instant) -> Self {
        Self {
            total,
            parts: vec![None; total as usize],
            filled: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

type EntryKey = (String, EnvelopeKind);

/// Per-peer, per-kind accumulator of chunk envelopes.
///
/// Slot writes are last-write-wins: a duplicate envelope overwrites its own
/// slot with identical data and never counts twice toward completion. An
/// envelope whose `total` differs from the in-flight entry starts a new
/// message and the old partial is dropped.
pub struct ReassemblyBuffer {
    entries: HashMap<EntryKey, ReassemblyEntry>,
    config: ChunkConfig,
}

impl ReassemblyBuffer {
    pub fn new(config: ChunkConfig) -> Self {
        Self {
            entries: HashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, peer_key: &str, kind: EnvelopeKind) -> bool {
        self.entries.contains_key(&(peer_key.to_string(), kind))
    }

    /// Feed one envelope; returns the full payload once every slot is filled.
    pub fn ingest(
        &mut self,
        peer_key: &str,
        envelope: ChunkEnvelope,
        now: Instant,
    ) -> Option<String> {
        if let Err(err) = envelope.validate(&self.config) {
            warn!(
                target = "signal_chunk::reassembly",
                peer_key,
                kind = ?envelope.kind,
                index = envelope.index,
                total = envelope.total,
                error = %err,
                "dropping malformed envelope"
            );
            return None;
        }

        let key: EntryKey = (peer_key.to_string(), envelope.kind);
        let replace = match self.entries.get(&key) {
            Some(entry) if entry.total != envelope.total => {
                debug!(
                    target = "signal_chunk::reassembly",
                    peer_key,
                    kind = ?envelope.kind,
                    old_total = entry.total,
                    new_total = envelope.total,
                    "new message supersedes partial"
                );
                true
            }
            Some(entry) if self.is_expired(entry, now) => true,
            Some(_) => false,
            None => {
                if self.entries.len() >= self.config.max_inflight {
                    self.evict_oldest();
                }
                false
            }
        };
        if replace {
            self.entries.remove(&key);
        }

        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| ReassemblyEntry::new(envelope.total, now));
        let slot = &mut entry.parts[envelope.index as usize];
        if slot.is_none() {
            entry.filled += 1;
        }
        *slot = Some(envelope.data);
        entry.updated_at = now;
        if entry.filled < entry.total {
            return None;
        }

        let entry = self.entries.remove(&key)?;
        match codec::join_parts(&entry.parts) {
            Ok(payload) => {
                debug!(
                    target = "signal_chunk::reassembly",
                    peer_key,
                    kind = ?key.1,
                    total = entry.total,
                    bytes = payload.len(),
                    elapsed_ms = now.saturating_duration_since(entry.created_at).as_millis() as u64,
                    "message reassembled"
                );
                Some(payload)
            }
            Err(err) => {
                warn!(
                    target = "signal_chunk::reassembly",
                    peer_key,
                    error = %err,
                    "reassembly finished with missing parts"
                );
                None
            }
        }
    }

    /// Parse a raw transport message and ingest it.
    pub fn ingest_wire(
        &mut self,
        peer_key: &str,
        bytes: &[u8],
        now: Instant,
    ) -> Option<(EnvelopeKind, String)> {
        match ChunkEnvelope::from_wire(bytes, &self.config) {
            Ok(envelope) => {
                let kind = envelope.kind;
                self.ingest(peer_key, envelope, now)
                    .map(|payload| (kind, payload))
            }
            Err(err) => {
                warn!(
                    target = "signal_chunk::reassembly",
                    peer_key,
                    len = bytes.len(),
                    error = %err,
                    "dropping undecodable envelope"
                );
                None
            }
        }
    }

    /// Drop every partial from `peer_key`, so a new link under the same key
    /// cannot complete a message started on the old one.
    pub fn forget(&mut self, peer_key: &str) -> Vec<GcEvent> {
        let mut dropped = Vec::new();
        self.entries.retain(|(key, kind), entry| {
            if key != peer_key {
                return true;
            }
            debug!(
                target = "signal_chunk::reassembly",
                peer_key = %key,
                kind = ?kind,
                filled = entry.filled,
                total = entry.total,
                "partial message forgotten"
            );
            dropped.push(GcEvent {
                peer_key: key.clone(),
                kind: *kind,
                reason: GcReason::Forgotten,
            });
            false
        });
        dropped
    }

    /// Drop entries idle for longer than the reassembly timeout.
    pub fn sweep(&mut self, now: Instant) -> Vec<GcEvent> {
        let timeout = self.config.reassembly_timeout;
        let mut dropped = Vec::new();
        self.entries.retain(|(peer_key, kind), entry| {
            let expired = now.saturating_duration_since(entry.updated_at) > timeout;
            if expired {
                debug!(
                    target = "signal_chunk::reassembly",
                    peer_key = %peer_key,
                    kind = ?kind,
                    filled = entry.filled,
                    total = entry.total,
                    "partial message expired"
                );
                dropped.push(GcEvent {
                    peer_key: peer_key.clone(),
                    kind: *kind,
                    reason: GcReason::Timeout,
                });
            }
            !expired
        });
        dropped
    }

    fn is_expired(&self, entry: &ReassemblyEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.updated_at) > self.config.reassembly_timeout
    }

    fn evict_oldest(&mut self) -> Option<GcEvent> {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.updated_at)
            .map(|(key, _)| key.clone())?;
        self.entries.remove(&oldest);
        warn!(
            target = "signal_chunk::reassembly",
            peer_key = %oldest.0,
            kind = ?oldest.1,
            "reassembly buffer full; evicted oldest partial"
        );
        Some(GcEvent {
            peer_key: oldest.0,
            kind: oldest.1,
            reason: GcReason::Capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use rand::{seq::SliceRandom, thread_rng};
    use std::time::Duration;

    fn buffer() -> ReassemblyBuffer {
        ReassemblyBuffer::new(ChunkConfig {
            max_envelope_bytes: 180,
            reassembly_timeout: Duration::from_secs(10),
            max_inflight: 4,
            ..ChunkConfig::default()
        })
    }

    fn sdp(len: usize) -> String {
        "a=candidate:1 1 udp 2130706431 192.168.1.4 50000 typ host\r\n"
            .chars()
            .cycle()
            .take(len)
            .collect()
    }

    fn feed_all(
        buf: &mut ReassemblyBuffer,
        envelopes: Vec<ChunkEnvelope>,
        now: Instant,
    ) -> Vec<String> {
        envelopes
            .into_iter()
            .filter_map(|env| buf.ingest("central", env, now))
            .collect()
    }

    #[test]
    fn any_permutation_completes_exactly_once() {
        let payload = sdp(2_500);
        let envelopes = encode(EnvelopeKind::Offer, &payload, 180).expect("encode");
        let now = Instant::now();
        for _ in 0..20 {
            let mut shuffled = envelopes.clone();
            shuffled.shuffle(&mut thread_rng());
            let mut buf = buffer();
            let done = feed_all(&mut buf, shuffled, now);
            assert_eq!(done, vec![payload.clone()]);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn reverse_order_thousand_byte_offer() {
        let payload = sdp(1_000);
        let mut envelopes = encode(EnvelopeKind::Offer, &payload, 180).expect("encode");
        assert_eq!(envelopes.len(), 6);
        envelopes.reverse();
        let mut buf = buffer();
        assert_eq!(feed_all(&mut buf, envelopes, Instant::now()), vec![payload]);
    }

    #[test]
    fn duplicates_before_completion_are_idempotent() {
        let payload = sdp(600);
        let envelopes = encode(EnvelopeKind::Answer, &payload, 180).expect("encode");
        let mut stream = vec![envelopes[0].clone(), envelopes[0].clone(), envelopes[2].clone()];
        stream.push(envelopes[2].clone());
        stream.extend(envelopes.iter().cloned());
        let mut buf = buffer();
        let done = feed_all(&mut buf, stream, Instant::now());
        assert_eq!(done, vec![payload]);
    }

    #[test]
    fn different_total_supersedes_partial() {
        let old = encode(EnvelopeKind::Offer, &sdp(500), 180).expect("encode");
        let fresh_payload = sdp(200);
        let fresh = encode(EnvelopeKind::Offer, &fresh_payload, 180).expect("encode");
        assert_ne!(old[0].total, fresh[0].total);

        let now = Instant::now();
        let mut buf = buffer();
        assert!(buf.ingest("central", old[0].clone(), now).is_none());
        assert!(buf.ingest("central", old[1].clone(), now).is_none());
        let done = feed_all(&mut buf, fresh, now);
        assert_eq!(done, vec![fresh_payload]);
        // The remaining old envelope opens a new entry; it cannot finish the old message.
        assert!(buf.ingest("central", old[2].clone(), now).is_none());
        assert!(buf.contains("central", EnvelopeKind::Offer));
    }

    #[test]
    fn kinds_and_peers_do_not_mix() {
        let offer = encode(EnvelopeKind::Offer, "o".repeat(300).as_str(), 180).expect("encode");
        let lobby = encode(EnvelopeKind::LobbyMessage, "l".repeat(300).as_str(), 180)
            .expect("encode");
        let now = Instant::now();
        let mut buf = buffer();
        assert!(buf.ingest("a", offer[0].clone(), now).is_none());
        assert!(buf.ingest("a", lobby[0].clone(), now).is_none());
        assert!(buf.ingest("b", offer[1].clone(), now).is_none());
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.ingest("a", lobby[1].clone(), now), Some("l".repeat(300)));
        assert_eq!(buf.ingest("a", offer[1].clone(), now), Some("o".repeat(300)));
    }

    #[test]
    fn idle_entries_are_swept() {
        let envelopes = encode(EnvelopeKind::Offer, &sdp(400), 180).expect("encode");
        let start = Instant::now();
        let mut buf = buffer();
        assert!(buf.ingest("central", envelopes[0].clone(), start).is_none());
        assert!(buf.sweep(start + Duration::from_secs(5)).is_empty());

        let dropped = buf.sweep(start + Duration::from_secs(11));
        assert_eq!(
            dropped,
            vec![GcEvent {
                peer_key: "central".into(),
                kind: EnvelopeKind::Offer,
                reason: GcReason::Timeout,
            }]
        );
        assert!(buf.is_empty());

        // Re-sending the same index starts over instead of resurrecting the old entry.
        let later = start + Duration::from_secs(12);
        assert!(buf.ingest("central", envelopes[1].clone(), later).is_none());
        assert!(buf.ingest("central", envelopes[2].clone(), later).is_none());
        assert!(buf.contains("central", EnvelopeKind::Offer));
    }

    #[test]
    fn expired_entry_is_not_resumed_without_sweep() {
        let payload = sdp(300);
        let envelopes = encode(EnvelopeKind::Offer, &payload, 180).expect("encode");
        let start = Instant::now();
        let mut buf = buffer();
        assert!(buf.ingest("central", envelopes[0].clone(), start).is_none());
        let late = start + Duration::from_secs(30);
        assert!(buf.ingest("central", envelopes[1].clone(), late).is_none());
        assert_eq!(buf.ingest("central", envelopes[0].clone(), late), Some(payload));
    }

    #[test]
    fn malformed_envelope_does_not_touch_entries() {
        let envelopes = encode(EnvelopeKind::Offer, &sdp(400), 180).expect("encode");
        let now = Instant::now();
        let mut buf = buffer();
        assert!(buf.ingest("central", envelopes[0].clone(), now).is_none());
        let bogus = ChunkEnvelope {
            kind: EnvelopeKind::Offer,
            index: 9,
            total: 5,
            data: "x".into(),
        };
        assert!(buf.ingest("central", bogus, now).is_none());
        assert!(buf.ingest_wire("central", b"not json", now).is_none());
        assert_eq!(buf.len(), 1);
        assert!(buf.ingest("central", envelopes[1].clone(), now).is_none());
        assert!(buf.ingest("central", envelopes[2].clone(), now).is_some());
    }

    #[test]
    fn announced_total_above_limit_allocates_nothing() {
        let now = Instant::now();
        let mut buf = buffer();
        let hostile = br#"{"t":"offer","idx":0,"total":4294967295,"data":"x"}"#;
        assert!(buf.ingest_wire("central", hostile, now).is_none());
        assert!(buf.is_empty());

        let at_limit = ChunkEnvelope {
            kind: EnvelopeKind::Offer,
            index: 0,
            total: buf.config().max_chunks,
            data: "x".into(),
        };
        assert!(buf.ingest("central", at_limit, now).is_none());
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn forgotten_partial_cannot_splice_into_next_message() {
        let stale = encode(EnvelopeKind::Offer, &"a".repeat(1_000), 180).expect("encode");
        let fresh_payload = "b".repeat(1_000);
        let mut fresh = encode(EnvelopeKind::Offer, &fresh_payload, 180).expect("encode");
        assert_eq!(stale[0].total, fresh[0].total);

        let now = Instant::now();
        let mut buf = buffer();
        for env in &stale[..3] {
            assert!(buf.ingest("central", env.clone(), now).is_none());
        }
        assert!(buf.ingest("other", stale[0].clone(), now).is_none());
        let dropped = buf.forget("central");
        assert_eq!(
            dropped,
            vec![GcEvent {
                peer_key: "central".into(),
                kind: EnvelopeKind::Offer,
                reason: GcReason::Forgotten,
            }]
        );
        assert!(buf.contains("other", EnvelopeKind::Offer));

        fresh.reverse();
        let mut done = Vec::new();
        for (seen, env) in fresh.into_iter().enumerate() {
            let result = buf.ingest("central", env, now);
            if seen < 5 {
                assert!(result.is_none(), "completed early after {seen} envelopes");
            }
            done.extend(result);
        }
        assert_eq!(done, vec![fresh_payload]);
    }

    #[test]
    fn capacity_evicts_oldest_partial() {
        let start = Instant::now();
        let mut buf = buffer();
        for (i, peer) in ["p0", "p1", "p2", "p3", "p4"].iter().enumerate() {
            let envelopes = encode(EnvelopeKind::Offer, &sdp(400), 180).expect("encode");
            let at = start + Duration::from_millis(i as u64);
            assert!(buf.ingest(peer, envelopes[0].clone(), at).is_none());
        }
        assert_eq!(buf.len(), 4);
        assert!(!buf.contains("p0", EnvelopeKind::Offer));
        assert!(buf.contains("p4", EnvelopeKind::Offer));
    }

    #[test]
    fn ingest_wire_round_trip() {
        let payload = sdp(700);
        let envelopes = encode(EnvelopeKind::Answer, &payload, 180).expect("encode");
        let now = Instant::now();
        let mut buf = buffer();
        let mut result = None;
        for env in envelopes {
            let bytes = env.to_wire().expect("wire");
            if let Some(done) = buf.ingest_wire("peripheral", &bytes, now) {
                result = Some(done);
            }
        }
        assert_eq!(result, Some((EnvelopeKind::Answer, payload)));
    }
}
