//! In-process stand-in for WebRTC: links created from one
//! [`LoopbackNetwork`] negotiate with synthetic SDP and exchange messages
//! through channels. Tests use its hooks to open channels by hand, inject
//! state changes, and inspect what each link saw.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{IceCandidate, LinkEvent, PeerConnectionState, PeerError, PeerId, PeerLink, PeerLinkFactory};

const CANDIDATE_LINES: u16 = 12;

type LinkKey = (String, String);

#[derive(Clone)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetState>>,
}

struct NetState {
    auto_open: bool,
    next_id: u64,
    links: HashMap<LinkKey, LinkRecord>,
    opened: HashMap<LinkKey, usize>,
    live: HashMap<u64, LinkKey>,
}

struct LinkRecord {
    id: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
    remote_description: Option<String>,
    candidates: Vec<IceCandidate>,
    sent: Vec<String>,
    paired_with: Option<u64>,
    open: bool,
    closed: bool,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNetwork {
    /// Links connect and open their channel as soon as the answer is applied.
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Links stay at `New` after negotiation until [`Self::open_channel`].
    pub fn manual_open() -> Self {
        Self::build(false)
    }

    fn build(auto_open: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetState {
                auto_open,
                next_id: 1,
                links: HashMap::new(),
                opened: HashMap::new(),
                live: HashMap::new(),
            })),
        }
    }

    pub fn factory(&self, local_id: impl Into<String>) -> LoopbackLinkFactory {
        LoopbackLinkFactory {
            network: self.clone(),
            local_id: local_id.into(),
        }
    }

    pub fn open_channel(&self, a: &str, b: &str) {
        connect(&mut self.inner.lock(), a, b);
    }

    pub fn set_state(&self, local: &str, remote: &str, state: PeerConnectionState) {
        if let Some(record) = self.inner.lock().links.get(&key(local, remote)) {
            let _ = record.events.send(LinkEvent::StateChanged(state));
        }
    }

    pub fn applied_candidates(&self, local: &str, remote: &str) -> Vec<IceCandidate> {
        self.inner
            .lock()
            .links
            .get(&key(local, remote))
            .map(|record| record.candidates.clone())
            .unwrap_or_default()
    }

    pub fn sent(&self, local: &str, remote: &str) -> Vec<String> {
        self.inner
            .lock()
            .links
            .get(&key(local, remote))
            .map(|record| record.sent.clone())
            .unwrap_or_default()
    }

    pub fn links_opened(&self, local: &str, remote: &str) -> usize {
        self.inner
            .lock()
            .opened
            .get(&key(local, remote))
            .copied()
            .unwrap_or(0)
    }

    /// Links created for this pair that have not been closed yet, including
    /// ones a newer link has replaced.
    pub fn live_links(&self, local: &str, remote: &str) -> usize {
        let link_key = key(local, remote);
        self.inner
            .lock()
            .live
            .values()
            .filter(|live| **live == link_key)
            .count()
    }

    pub fn is_closed(&self, local: &str, remote: &str) -> bool {
        self.inner
            .lock()
            .links
            .get(&key(local, remote))
            .is_none_or(|record| record.closed)
    }
}

fn key(local: &str, remote: &str) -> LinkKey {
    (local.to_string(), remote.to_string())
}

/// Bring both ends up if both have applied the other's description.
fn connect(state: &mut NetState, a: &str, b: &str) {
    let ready = |record: Option<&LinkRecord>| {
        record.is_some_and(|record| !record.closed && record.remote_description.is_some())
    };
    if !ready(state.links.get(&key(a, b))) || !ready(state.links.get(&key(b, a))) {
        debug!(target = "motion_bridge::peer::loopback", a, b, "ends not ready to connect");
        return;
    }
    let ids = (
        state.links.get(&key(a, b)).map(|record| record.id),
        state.links.get(&key(b, a)).map(|record| record.id),
    );
    for (local, remote, counterpart) in [(a, b, ids.1), (b, a, ids.0)] {
        if let Some(record) = state.links.get_mut(&key(local, remote)) {
            if record.open {
                continue;
            }
            record.open = true;
            record.paired_with = counterpart;
            let _ = record
                .events
                .send(LinkEvent::StateChanged(PeerConnectionState::Connecting));
            let _ = record
                .events
                .send(LinkEvent::StateChanged(PeerConnectionState::Connected));
            let _ = record.events.send(LinkEvent::ChannelOpen);
        }
    }
}

fn synthetic_sdp(kind: &str, from: &str, to: &str, id: u64) -> String {
    let fingerprint: Vec<String> = (0..32u64)
        .map(|i| format!("{:02X}", (id.wrapping_mul(31).wrapping_add(i * 7)) as u8))
        .collect();
    let mut sdp = format!(
        "v=0\r\no=- {id} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=group:BUNDLE 0\r\n\
         a=x-loopback-type:{kind}\r\na=x-loopback-from:{from}\r\na=x-loopback-to:{to}\r\n\
         m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\nc=IN IP4 0.0.0.0\r\n\
         a=mid:0\r\na=sctp-port:5000\r\na=fingerprint:sha-256 {}\r\n",
        fingerprint.join(":")
    );
    for i in 0..CANDIDATE_LINES {
        sdp.push_str(&format!(
            "a=candidate:{i} 1 udp {} 127.0.0.1 {} typ host generation 0\r\n",
            2_122_260_223u32 - u32::from(i),
            50_000 + i
        ));
    }
    sdp
}

fn sdp_attribute<'a>(sdp: &'a str, name: &str) -> Option<&'a str> {
    sdp.lines()
        .find_map(|line| line.trim_end().strip_prefix(&format!("a=x-loopback-{name}:")))
}

fn check_description(sdp: &str, kind: &str, from: &str, to: &str) -> Result<(), PeerError> {
    let matches = sdp_attribute(sdp, "type") == Some(kind)
        && sdp_attribute(sdp, "from") == Some(from)
        && sdp_attribute(sdp, "to") == Some(to);
    if matches {
        Ok(())
    } else {
        Err(PeerError::InvalidDescription(format!(
            "expected {kind} from {from} to {to}"
        )))
    }
}

pub struct LoopbackLinkFactory {
    network: LoopbackNetwork,
    local_id: String,
}

#[async_trait]
impl PeerLinkFactory for LoopbackLinkFactory {
    async fn open(
        &self,
        peer_id: &PeerId,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, PeerError> {
        let mut state = self.network.inner.lock();
        let id = state.next_id;
        state.next_id += 1;
        let link_key = key(&self.local_id, peer_id.as_str());
        *state.opened.entry(link_key.clone()).or_default() += 1;
        state.live.insert(id, link_key.clone());
        state.links.insert(
            link_key,
            LinkRecord {
                id,
                events,
                remote_description: None,
                candidates: Vec::new(),
                sent: Vec::new(),
                paired_with: None,
                open: false,
                closed: false,
            },
        );
        Ok(Arc::new(LoopbackLink {
            network: self.network.clone(),
            local: self.local_id.clone(),
            remote: peer_id.as_str().to_string(),
            id,
        }))
    }
}

struct LoopbackLink {
    network: LoopbackNetwork,
    local: String,
    remote: String,
    id: u64,
}

impl LoopbackLink {
    fn with_record<T>(
        &self,
        f: impl FnOnce(&mut NetState, &mut LinkRecord) -> Result<T, PeerError>,
    ) -> Result<T, PeerError> {
        let mut state = self.network.inner.lock();
        let link_key = key(&self.local, &self.remote);
        let mut record = match state.links.remove(&link_key) {
            Some(record) if record.id == self.id && !record.closed => record,
            Some(other) => {
                state.links.insert(link_key, other);
                return Err(PeerError::Link("loopback link closed".into()));
            }
            None => return Err(PeerError::Link("loopback link closed".into())),
        };
        let result = f(&mut state, &mut record);
        state.links.insert(link_key, record);
        result
    }

    fn host_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.id,
                40_000 + self.id % 10_000
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn create_offer(&self) -> Result<String, PeerError> {
        let candidate = self.host_candidate();
        self.with_record(|_, record| {
            let _ = record.events.send(LinkEvent::LocalCandidate(candidate));
            Ok(synthetic_sdp("offer", &self.local, &self.remote, self.id))
        })
    }

    async fn accept_offer(&self, offer: &str) -> Result<String, PeerError> {
        check_description(offer, "offer", &self.remote, &self.local)?;
        let candidate = self.host_candidate();
        self.with_record(|_, record| {
            record.remote_description = Some(offer.to_string());
            let _ = record.events.send(LinkEvent::LocalCandidate(candidate));
            Ok(synthetic_sdp("answer", &self.local, &self.remote, self.id))
        })
    }

    async fn apply_answer(&self, answer: &str) -> Result<(), PeerError> {
        check_description(answer, "answer", &self.remote, &self.local)?;
        let auto_open = self.with_record(|state, record| {
            record.remote_description = Some(answer.to_string());
            Ok(state.auto_open)
        })?;
        if auto_open {
            self.network.open_channel(&self.local, &self.remote);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        self.with_record(|_, record| {
            if record.remote_description.is_none() {
                return Err(PeerError::Link("remote description not set".into()));
            }
            record.candidates.push(candidate.clone());
            Ok(())
        })
    }

    async fn send_text(&self, text: &str) -> Result<(), PeerError> {
        self.with_record(|state, record| {
            if !record.open {
                return Err(PeerError::Link("data channel not open".into()));
            }
            record.sent.push(text.to_string());
            let counterpart = state
                .links
                .get(&key(&self.remote, &self.local))
                .filter(|other| Some(other.id) == record.paired_with && other.open);
            if let Some(other) = counterpart {
                let _ = other.events.send(LinkEvent::Message(text.to_string()));
            }
            Ok(())
        })
    }

    async fn close(&self) {
        self.network.inner.lock().live.remove(&self.id);
        let closed = self.with_record(|state, record| {
            record.closed = true;
            record.open = false;
            let _ = record
                .events
                .send(LinkEvent::StateChanged(PeerConnectionState::Closed));
            let counterpart = state
                .links
                .get_mut(&key(&self.remote, &self.local))
                .filter(|other| Some(other.id) == record.paired_with && !other.closed);
            if let Some(other) = counterpart {
                other.open = false;
                let _ = other.events.send(LinkEvent::ChannelClosed);
                let _ = other
                    .events
                    .send(LinkEvent::StateChanged(PeerConnectionState::Disconnected));
                let _ = other
                    .events
                    .send(LinkEvent::StateChanged(PeerConnectionState::Failed));
            }
            Ok(())
        });
        if closed.is_ok() {
            debug!(
                target = "motion_bridge::peer::loopback",
                local = %self.local,
                remote = %self.remote,
                "loopback link closed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_descriptions_are_kilobyte_sized() {
        let sdp = synthetic_sdp("offer", "a", "b", 7);
        assert!(sdp.len() > 1000, "len {}", sdp.len());
        assert!(check_description(&sdp, "offer", "a", "b").is_ok());
        assert!(check_description(&sdp, "answer", "a", "b").is_err());
        assert!(check_description(&sdp, "offer", "b", "a").is_err());
    }

    #[tokio::test]
    async fn negotiated_links_exchange_messages() {
        let network = LoopbackNetwork::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = network.factory("a").open(&"b".into(), a_tx).await.expect("open a");
        let b = network.factory("b").open(&"a".into(), b_tx).await.expect("open b");

        let offer = a.create_offer().await.expect("offer");
        let answer = b.accept_offer(&offer).await.expect("answer");
        assert!(b.accept_offer("v=0\r\n").await.is_err());
        a.apply_answer(&answer).await.expect("apply");
        a.send_text("hello").await.expect("send");

        let mut saw_open = false;
        while let Ok(event) = b_rx.try_recv() {
            match event {
                LinkEvent::ChannelOpen => saw_open = true,
                LinkEvent::Message(text) => {
                    assert!(saw_open);
                    assert_eq!(text, "hello");
                }
                _ => {}
            }
        }
        assert!(saw_open);

        b.close().await;
        let states: Vec<PeerConnectionState> = std::iter::from_fn(|| a_rx.try_recv().ok())
            .filter_map(|event| match event {
                LinkEvent::StateChanged(state) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states.last(), Some(&PeerConnectionState::Failed));
        assert!(network.is_closed("b", "a"));
        assert_eq!(network.live_links("b", "a"), 0);
        assert_eq!(network.live_links("a", "b"), 1);
    }
}
