use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{
    IceCandidate, LinkEvent, PeerConnectionState, PeerError, PeerEvent, PeerId, PeerLink,
    PeerLinkFactory,
};

const EVENT_CAPACITY: usize = 1024;

/// Owns at most one live connection per peer id.
///
/// Link callbacks are tagged with a generation number; events from a
/// connection that has since been replaced or closed are dropped.
#[derive(Clone)]
pub struct PeerConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    factory: Arc<dyn PeerLinkFactory>,
    peers: RwLock<HashMap<PeerId, Arc<AsyncMutex<PeerSlot>>>>,
    next_generation: AtomicU64,
    events: broadcast::Sender<PeerEvent>,
    max_pending: usize,
}

struct PeerSlot {
    generation: u64,
    link: Arc<dyn PeerLink>,
    state: PeerConnectionState,
    channel_open: bool,
    remote_description_set: bool,
    outbound: VecDeque<String>,
    early_candidates: VecDeque<IceCandidate>,
    pump: Option<JoinHandle<()>>,
}

impl PeerSlot {
    async fn shut_down(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.outbound.clear();
        self.early_candidates.clear();
        self.channel_open = false;
        self.link.close().await;
    }
}

impl PeerConnectionManager {
    pub fn new(factory: Arc<dyn PeerLinkFactory>, max_pending: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                factory,
                peers: RwLock::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                events,
                max_pending: max_pending.max(1),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.inner.peers.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    pub async fn state(&self, peer_id: &PeerId) -> Option<PeerConnectionState> {
        let slot = self.slot(peer_id)?;
        let guard = slot.lock().await;
        Some(guard.state)
    }

    /// Open a fresh connection (closing any previous one for this peer),
    /// create the data channel, and return the offer SDP.
    pub async fn create_connection_and_offer(&self, peer_id: &PeerId) -> Result<String, PeerError> {
        let slot = self.open_slot(peer_id).await?;
        let link = Arc::clone(&slot.lock().await.link);
        let offer = link.create_offer().await?;
        debug!(
            target = "motion_bridge::peer",
            peer = %peer_id,
            len = offer.len(),
            "offer created"
        );
        Ok(offer)
    }

    /// Open a fresh connection for an incoming offer and return the answer.
    /// Candidates queued for this connection are applied afterwards.
    pub async fn handle_offer_and_create_answer(
        &self,
        peer_id: &PeerId,
        offer: &str,
    ) -> Result<String, PeerError> {
        let slot = self.open_slot(peer_id).await?;
        let mut guard = slot.lock().await;
        let answer = guard.link.accept_offer(offer).await?;
        guard.remote_description_set = true;
        drain_candidates(peer_id, &mut guard).await;
        debug!(
            target = "motion_bridge::peer",
            peer = %peer_id,
            len = answer.len(),
            "answer created"
        );
        Ok(answer)
    }

    pub async fn handle_answer(&self, peer_id: &PeerId, answer: &str) -> Result<(), PeerError> {
        let slot = self
            .slot(peer_id)
            .ok_or_else(|| PeerError::UnknownPeer(peer_id.clone()))?;
        let mut guard = slot.lock().await;
        guard.link.apply_answer(answer).await?;
        guard.remote_description_set = true;
        drain_candidates(peer_id, &mut guard).await;
        debug!(target = "motion_bridge::peer", peer = %peer_id, "answer applied");
        Ok(())
    }

    pub async fn add_ice_candidate(
        &self,
        peer_id: &PeerId,
        candidate: IceCandidate,
    ) -> Result<(), PeerError> {
        let slot = self
            .slot(peer_id)
            .ok_or_else(|| PeerError::UnknownPeer(peer_id.clone()))?;
        let mut guard = slot.lock().await;
        if guard.remote_description_set {
            return guard.link.add_ice_candidate(&candidate).await;
        }
        if guard.early_candidates.len() >= self.inner.max_pending {
            warn!(
                target = "motion_bridge::peer",
                peer = %peer_id,
                limit = self.inner.max_pending,
                "early candidate queue full"
            );
            return Err(PeerError::QueueFull {
                peer_id: peer_id.clone(),
                limit: self.inner.max_pending,
            });
        }
        guard.early_candidates.push_back(candidate);
        trace!(
            target = "motion_bridge::peer",
            peer = %peer_id,
            queued = guard.early_candidates.len(),
            "candidate queued until remote description"
        );
        Ok(())
    }

    /// Send now if the channel is open, otherwise queue in order; queued
    /// messages go out exactly once when the channel opens.
    pub async fn send_message(&self, peer_id: &PeerId, message: &str) -> Result<(), PeerError> {
        let slot = self
            .slot(peer_id)
            .ok_or_else(|| PeerError::UnknownPeer(peer_id.clone()))?;
        let mut guard = slot.lock().await;
        if guard.channel_open {
            return guard.link.send_text(message).await;
        }
        if guard.outbound.len() >= self.inner.max_pending {
            return Err(PeerError::QueueFull {
                peer_id: peer_id.clone(),
                limit: self.inner.max_pending,
            });
        }
        guard.outbound.push_back(message.to_string());
        trace!(
            target = "motion_bridge::peer",
            peer = %peer_id,
            queued = guard.outbound.len(),
            "message queued until channel opens"
        );
        Ok(())
    }

    /// Send to every known peer; returns how many accepted the message.
    pub async fn broadcast_message(&self, message: &str) -> usize {
        let mut delivered = 0;
        for peer_id in self.peers() {
            match self.send_message(&peer_id, message).await {
                Ok(()) => delivered += 1,
                Err(err) => warn!(
                    target = "motion_bridge::peer",
                    peer = %peer_id,
                    error = %err,
                    "broadcast to peer failed"
                ),
            }
        }
        delivered
    }

    /// Close and forget the peer. Returns false when it was not known.
    pub async fn close_connection(&self, peer_id: &PeerId) -> bool {
        let Some(slot) = self.inner.peers.write().remove(peer_id) else {
            return false;
        };
        let mut guard = slot.lock().await;
        guard.shut_down().await;
        guard.state = PeerConnectionState::Closed;
        info!(target = "motion_bridge::peer", peer = %peer_id, "connection closed");
        self.emit(PeerEvent::StateChanged {
            peer_id: peer_id.clone(),
            state: PeerConnectionState::Closed,
        });
        true
    }

    pub async fn close_all_connections(&self) {
        let drained: Vec<PeerId> = self.inner.peers.read().keys().cloned().collect();
        for peer_id in drained {
            self.close_connection(&peer_id).await;
        }
    }

    fn slot(&self, peer_id: &PeerId) -> Option<Arc<AsyncMutex<PeerSlot>>> {
        self.inner.peers.read().get(peer_id).cloned()
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.inner.events.send(event);
    }

    async fn open_slot(&self, peer_id: &PeerId) -> Result<Arc<AsyncMutex<PeerSlot>>, PeerError> {
        let stale = self.inner.peers.write().remove(peer_id);
        if let Some(stale) = stale {
            info!(
                target = "motion_bridge::peer",
                peer = %peer_id,
                "replacing existing connection"
            );
            stale.lock().await.shut_down().await;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let link = self.inner.factory.open(peer_id, tx).await?;
        let pump = tokio::spawn(pump_link_events(
            Arc::downgrade(&self.inner),
            peer_id.clone(),
            generation,
            rx,
        ));
        let slot = Arc::new(AsyncMutex::new(PeerSlot {
            generation,
            link,
            state: PeerConnectionState::New,
            channel_open: false,
            remote_description_set: false,
            outbound: VecDeque::new(),
            early_candidates: VecDeque::new(),
            pump: Some(pump),
        }));
        let raced = self
            .inner
            .peers
            .write()
            .insert(peer_id.clone(), Arc::clone(&slot));
        if let Some(raced) = raced {
            raced.lock().await.shut_down().await;
        }
        debug!(
            target = "motion_bridge::peer",
            peer = %peer_id,
            generation,
            "connection opened"
        );
        self.emit(PeerEvent::StateChanged {
            peer_id: peer_id.clone(),
            state: PeerConnectionState::New,
        });
        Ok(slot)
    }

    /// Returns false once the link reached a terminal state and its pump
    /// should stop.
    async fn handle_link_event(&self, peer_id: &PeerId, generation: u64, event: LinkEvent) -> bool {
        let Some(slot) = self.slot(peer_id) else {
            trace!(target = "motion_bridge::peer", peer = %peer_id, "event for unknown peer");
            return true;
        };
        let mut guard = slot.lock().await;
        if guard.generation != generation {
            trace!(
                target = "motion_bridge::peer",
                peer = %peer_id,
                generation,
                current = guard.generation,
                "dropping stale link event"
            );
            return true;
        }
        match event {
            LinkEvent::StateChanged(state) => {
                guard.state = state;
                info!(
                    target = "motion_bridge::peer",
                    peer = %peer_id,
                    state = ?state,
                    "connection state changed"
                );
                self.emit(PeerEvent::StateChanged {
                    peer_id: peer_id.clone(),
                    state,
                });
                if state.is_terminal() {
                    {
                        let mut peers = self.inner.peers.write();
                        if peers
                            .get(peer_id)
                            .is_some_and(|current| Arc::ptr_eq(current, &slot))
                        {
                            peers.remove(peer_id);
                        }
                    }
                    // This task is the pump; let it end on its own.
                    guard.pump = None;
                    guard.shut_down().await;
                    return false;
                }
            }
            LinkEvent::ChannelOpen => {
                guard.channel_open = true;
                let queued = guard.outbound.len();
                while let Some(message) = guard.outbound.pop_front() {
                    if let Err(err) = guard.link.send_text(&message).await {
                        warn!(
                            target = "motion_bridge::peer",
                            peer = %peer_id,
                            error = %err,
                            "failed to flush queued message"
                        );
                    }
                }
                debug!(
                    target = "motion_bridge::peer",
                    peer = %peer_id,
                    flushed = queued,
                    "data channel open"
                );
                self.emit(PeerEvent::ChannelOpen {
                    peer_id: peer_id.clone(),
                });
            }
            LinkEvent::ChannelClosed => {
                guard.channel_open = false;
                debug!(target = "motion_bridge::peer", peer = %peer_id, "data channel closed");
            }
            LinkEvent::Message(text) => self.emit(PeerEvent::Message {
                peer_id: peer_id.clone(),
                text,
            }),
            LinkEvent::LocalCandidate(candidate) => self.emit(PeerEvent::LocalCandidate {
                peer_id: peer_id.clone(),
                candidate,
            }),
        }
        true
    }
}

async fn drain_candidates(peer_id: &PeerId, slot: &mut PeerSlot) {
    while let Some(candidate) = slot.early_candidates.pop_front() {
        if let Err(err) = slot.link.add_ice_candidate(&candidate).await {
            warn!(
                target = "motion_bridge::peer",
                peer = %peer_id,
                error = %err,
                "failed to apply queued candidate"
            );
        }
    }
}

async fn pump_link_events(
    inner: Weak<ManagerInner>,
    peer_id: PeerId,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let manager = PeerConnectionManager { inner };
        if !manager.handle_link_event(&peer_id, generation, event).await {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{LoopbackNetwork, PeerEvent};
    use std::time::Duration;
    use tokio::time::timeout;

    fn pair(network: &LoopbackNetwork, max_pending: usize) -> (PeerConnectionManager, PeerConnectionManager) {
        (
            PeerConnectionManager::new(Arc::new(network.factory("alice")), max_pending),
            PeerConnectionManager::new(Arc::new(network.factory("bob")), max_pending),
        )
    }

    async fn next_message(events: &mut broadcast::Receiver<PeerEvent>) -> (PeerId, String) {
        loop {
            match timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Ok(PeerEvent::Message { peer_id, text })) => return (peer_id, text),
                Ok(Ok(_)) => continue,
                other => panic!("no message: {other:?}"),
            }
        }
    }

    async fn wait_for_state(
        events: &mut broadcast::Receiver<PeerEvent>,
        want: PeerConnectionState,
    ) {
        loop {
            match timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Ok(PeerEvent::StateChanged { state, .. })) if state == want => return,
                Ok(Ok(_)) => continue,
                other => panic!("never reached {want:?}: {other:?}"),
            }
        }
    }

    async fn negotiate(alice: &PeerConnectionManager, bob: &PeerConnectionManager) {
        let offer = alice
            .create_connection_and_offer(&"bob".into())
            .await
            .expect("offer");
        let answer = bob
            .handle_offer_and_create_answer(&"alice".into(), &offer)
            .await
            .expect("answer");
        alice.handle_answer(&"bob".into(), &answer).await.expect("apply");
    }

    #[tokio::test]
    async fn queued_messages_flush_in_order_once_open() {
        let network = LoopbackNetwork::manual_open();
        let (alice, bob) = pair(&network, 16);
        let mut bob_events = bob.subscribe();
        negotiate(&alice, &bob).await;

        for seq in 0..5 {
            alice
                .send_message(&"bob".into(), &format!("m{seq}"))
                .await
                .expect("queue");
        }
        network.open_channel("alice", "bob");
        for seq in 0..5 {
            let (from, text) = next_message(&mut bob_events).await;
            assert_eq!(from.as_str(), "alice");
            assert_eq!(text, format!("m{seq}"));
        }
        alice.send_message(&"bob".into(), "live").await.expect("send");
        assert_eq!(next_message(&mut bob_events).await.1, "live");
        assert_eq!(network.sent("alice", "bob").len(), 6);
    }

    #[tokio::test]
    async fn early_candidates_wait_for_remote_description() {
        let network = LoopbackNetwork::new();
        let (alice, bob) = pair(&network, 16);
        let offer = alice
            .create_connection_and_offer(&"bob".into())
            .await
            .expect("offer");
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 192.0.2.7 4000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        alice
            .add_ice_candidate(&"bob".into(), candidate.clone())
            .await
            .expect("queued");
        assert!(network.applied_candidates("alice", "bob").is_empty());

        let answer = bob
            .handle_offer_and_create_answer(&"alice".into(), &offer)
            .await
            .expect("answer");
        alice.handle_answer(&"bob".into(), &answer).await.expect("apply");
        assert_eq!(network.applied_candidates("alice", "bob"), vec![candidate]);
    }

    #[tokio::test]
    async fn candidate_for_unknown_peer_is_an_error() {
        let network = LoopbackNetwork::new();
        let (alice, _) = pair(&network, 16);
        let err = alice
            .add_ice_candidate(
                &"ghost".into(),
                IceCandidate {
                    candidate: "c".into(),
                    sdp_mid: None,
                    sdp_mline_index: None,
                },
            )
            .await
            .expect_err("unknown");
        assert!(matches!(err, PeerError::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn queues_are_bounded() {
        let network = LoopbackNetwork::manual_open();
        let (alice, _bob) = pair(&network, 2);
        alice
            .create_connection_and_offer(&"bob".into())
            .await
            .expect("offer");
        alice.send_message(&"bob".into(), "1").await.expect("queue");
        alice.send_message(&"bob".into(), "2").await.expect("queue");
        let err = alice.send_message(&"bob".into(), "3").await.expect_err("full");
        assert!(matches!(err, PeerError::QueueFull { limit: 2, .. }));
    }

    #[tokio::test]
    async fn recreating_a_connection_drops_stale_events() {
        let network = LoopbackNetwork::manual_open();
        let (alice, bob) = pair(&network, 16);
        negotiate(&alice, &bob).await;
        let mut events = alice.subscribe();

        alice
            .create_connection_and_offer(&"bob".into())
            .await
            .expect("second offer");
        assert_eq!(network.links_opened("alice", "bob"), 2);
        assert_eq!(network.live_links("alice", "bob"), 1);
        // A late failure from the first link must not touch the new one.
        let keep_pumping = alice
            .handle_link_event(
                &"bob".into(),
                1,
                LinkEvent::StateChanged(PeerConnectionState::Failed),
            )
            .await;
        assert!(keep_pumping);
        assert_eq!(
            alice.state(&"bob".into()).await,
            Some(PeerConnectionState::New)
        );
        assert!(matches!(
            events.try_recv(),
            Ok(PeerEvent::StateChanged {
                state: PeerConnectionState::New,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn failure_removes_the_peer() {
        let network = LoopbackNetwork::new();
        let (alice, bob) = pair(&network, 16);
        let mut events = alice.subscribe();
        negotiate(&alice, &bob).await;
        wait_for_state(&mut events, PeerConnectionState::Connected).await;

        network.set_state("alice", "bob", PeerConnectionState::Failed);
        wait_for_state(&mut events, PeerConnectionState::Failed).await;
        tokio::task::yield_now().await;
        assert!(alice.peers().is_empty());
        assert!(matches!(
            alice.send_message(&"bob".into(), "late").await,
            Err(PeerError::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_peer_and_close_all_is_idempotent() {
        let network = LoopbackNetwork::new();
        let hub = PeerConnectionManager::new(Arc::new(network.factory("hub")), 16);
        let mut spokes = Vec::new();
        for name in ["s1", "s2", "s3"] {
            let spoke = PeerConnectionManager::new(Arc::new(network.factory(name)), 16);
            let offer = hub
                .create_connection_and_offer(&name.into())
                .await
                .expect("offer");
            let answer = spoke
                .handle_offer_and_create_answer(&"hub".into(), &offer)
                .await
                .expect("answer");
            hub.handle_answer(&name.into(), &answer).await.expect("apply");
            spokes.push((spoke.subscribe(), spoke));
        }
        assert_eq!(hub.broadcast_message("go").await, 3);
        for (events, _) in spokes.iter_mut() {
            assert_eq!(next_message(events).await.1, "go");
        }

        hub.close_all_connections().await;
        hub.close_all_connections().await;
        assert!(hub.peers().is_empty());
        assert_eq!(hub.broadcast_message("nobody").await, 0);
        assert!(!hub.close_connection(&"s1".into()).await);
    }
}
