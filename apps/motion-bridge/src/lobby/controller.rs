use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::presence::Presence;
use super::{LobbyError, LobbyMessage, LobbyMessageHandler, PLAYER_INFO_TYPE, PeerEntry};
use crate::motion::MotionEvent;
use crate::peer::{PeerConnectionManager, PeerEvent, PeerId};

/// Tracks lobby members and their connection state, removes peers whose
/// connection failed once the grace period passes, and routes application
/// messages to the handler.
#[derive(Clone)]
pub struct LobbySessionController {
    pub(super) inner: Arc<LobbyInner>,
}

pub(super) struct LobbyInner {
    pub(super) local_id: PeerId,
    pub(super) manager: PeerConnectionManager,
    handler: Arc<dyn LobbyMessageHandler>,
    grace_period: Duration,
    pub(super) registry: RwLock<HashMap<PeerId, PeerEntry>>,
    removals: Mutex<HashMap<PeerId, JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    pub(super) presence: Mutex<Option<Presence>>,
}

impl Drop for LobbyInner {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.get_mut().take() {
            supervisor.abort();
        }
        for (_, removal) in self.removals.get_mut().drain() {
            removal.abort();
        }
        if let Some(presence) = self.presence.get_mut().take() {
            presence.shut_down();
        }
    }
}

impl LobbySessionController {
    /// Must be called inside a tokio runtime; the supervisor task starts
    /// right away.
    pub fn new(
        local_id: impl Into<PeerId>,
        manager: PeerConnectionManager,
        handler: Arc<dyn LobbyMessageHandler>,
        grace_period: Duration,
    ) -> Self {
        let events = manager.subscribe();
        let inner = Arc::new(LobbyInner {
            local_id: local_id.into(),
            manager,
            handler,
            grace_period,
            registry: RwLock::new(HashMap::new()),
            removals: Mutex::new(HashMap::new()),
            supervisor: Mutex::new(None),
            presence: Mutex::new(None),
        });
        let supervisor = tokio::spawn(supervise(Arc::downgrade(&inner), events));
        *inner.supervisor.lock() = Some(supervisor);
        Self { inner }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.inner.local_id
    }

    pub fn manager(&self) -> &PeerConnectionManager {
        &self.inner.manager
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<PeerEntry> {
        self.inner.registry.read().get(peer_id).cloned()
    }

    pub fn peers(&self) -> Vec<(PeerId, PeerEntry)> {
        let mut peers: Vec<(PeerId, PeerEntry)> = self
            .inner
            .registry
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();
        peers.sort_by(|a, b| a.0.cmp(&b.0));
        peers
    }

    /// Register the peer and start a connection to it; returns the offer
    /// to deliver over whatever signaling path found the peer.
    pub async fn on_peer_discovered(&self, peer_id: &PeerId) -> Result<String, LobbyError> {
        self.cancel_removal(peer_id);
        self.inner
            .registry
            .write()
            .entry(peer_id.clone())
            .or_insert_with(|| PeerEntry::new(Instant::now()));
        info!(target = "motion_bridge::lobby", peer = %peer_id, "peer discovered");
        Ok(self.inner.manager.create_connection_and_offer(peer_id).await?)
    }

    pub async fn send_to(&self, peer_id: &PeerId, message: &LobbyMessage) -> Result<(), LobbyError> {
        let text = serde_json::to_string(message)?;
        self.inner.manager.send_message(peer_id, &text).await?;
        Ok(())
    }

    /// Returns how many peers accepted the message.
    pub async fn broadcast(&self, message: &LobbyMessage) -> Result<usize, LobbyError> {
        let text = serde_json::to_string(message)?;
        Ok(self.inner.manager.broadcast_message(&text).await)
    }

    pub async fn broadcast_motion(&self, event: &MotionEvent) -> Result<usize, LobbyError> {
        self.broadcast(&LobbyMessage::motion(event)?).await
    }

    async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::StateChanged { peer_id, state } => {
                let known = {
                    let mut registry = self.inner.registry.write();
                    match registry.get_mut(&peer_id) {
                        Some(entry) => {
                            entry.state = state;
                            entry.last_seen = Instant::now();
                            true
                        }
                        None if state.is_live() => {
                            let mut entry = PeerEntry::new(Instant::now());
                            entry.state = state;
                            registry.insert(peer_id.clone(), entry);
                            true
                        }
                        None => false,
                    }
                };
                if !known {
                    trace!(
                        target = "motion_bridge::lobby",
                        peer = %peer_id,
                        ?state,
                        "state change for departed peer"
                    );
                    return;
                }
                if state.is_terminal() {
                    self.schedule_removal(&peer_id);
                } else {
                    self.cancel_removal(&peer_id);
                }
            }
            PeerEvent::ChannelOpen { peer_id } => {
                info!(target = "motion_bridge::lobby", peer = %peer_id, "data channel ready");
                if let Some(profile) = self.profile() {
                    let hello = LobbyMessage::player_info(&profile.name, profile.ready);
                    if let Err(err) = self.send_to(&peer_id, &hello).await {
                        warn!(
                            target = "motion_bridge::lobby",
                            peer = %peer_id,
                            error = %err,
                            "failed to send player info"
                        );
                    }
                }
            }
            PeerEvent::Message { peer_id, text } => self.route_message(&peer_id, &text),
            PeerEvent::LocalCandidate { peer_id, candidate } => {
                self.forward_candidate(&peer_id, candidate);
            }
        }
    }

    fn route_message(&self, peer_id: &PeerId, text: &str) {
        let Some(message) = LobbyMessage::parse(text) else {
            debug!(
                target = "motion_bridge::lobby",
                peer = %peer_id,
                len = text.len(),
                "dropping untyped message"
            );
            return;
        };
        {
            let mut registry = self.inner.registry.write();
            if let Some(entry) = registry.get_mut(peer_id) {
                entry.last_seen = Instant::now();
                if message.kind == PLAYER_INFO_TYPE {
                    if let Some(name) = message.fields.get("name").and_then(Value::as_str) {
                        entry.display_name = Some(name.to_string());
                    }
                    if let Some(ready) = message.fields.get("ready").and_then(Value::as_bool) {
                        entry.ready = ready;
                    }
                }
            }
        }
        self.inner.handler.handle(peer_id, &message);
    }

    fn schedule_removal(&self, peer_id: &PeerId) {
        let mut removals = self.inner.removals.lock();
        if removals
            .get(peer_id)
            .is_some_and(|removal| !removal.is_finished())
        {
            return;
        }
        debug!(
            target = "motion_bridge::lobby",
            peer = %peer_id,
            grace_ms = self.inner.grace_period.as_millis() as u64,
            "peer connection down; removal scheduled"
        );
        let weak = Arc::downgrade(&self.inner);
        let grace = self.inner.grace_period;
        let peer = peer_id.clone();
        let removal = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let removed = {
                let mut registry = inner.registry.write();
                let still_down = registry
                    .get(&peer)
                    .is_some_and(|entry| entry.state.is_terminal());
                still_down && registry.remove(&peer).is_some()
            };
            inner.removals.lock().remove(&peer);
            if removed {
                info!(target = "motion_bridge::lobby", peer = %peer, "peer removed");
                inner.manager.close_connection(&peer).await;
            }
        });
        removals.insert(peer_id.clone(), removal);
    }

    pub(super) fn cancel_removal(&self, peer_id: &PeerId) {
        if let Some(removal) = self.inner.removals.lock().remove(peer_id) {
            removal.abort();
            debug!(target = "motion_bridge::lobby", peer = %peer_id, "peer recovered; removal cancelled");
        }
    }

    pub(super) fn cancel_all_removals(&self) {
        for (_, removal) in self.inner.removals.lock().drain() {
            removal.abort();
        }
    }
}

async fn supervise(inner: Weak<LobbyInner>, mut events: broadcast::Receiver<PeerEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(target = "motion_bridge::lobby", skipped, "lobby fell behind peer events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        LobbySessionController { inner }.handle_peer_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_timeout::tokio_timeout_test;
    use crate::peer::{LoopbackNetwork, PeerConnectionState};
    use std::sync::Mutex as StdMutex;

    type Seen = Arc<StdMutex<Vec<(String, String)>>>;

    fn recording_handler() -> (Arc<dyn LobbyMessageHandler>, Seen) {
        let seen: Seen = Arc::default();
        let sink = Arc::clone(&seen);
        let handler = move |from: &PeerId, message: &LobbyMessage| {
            sink.lock()
                .expect("lock")
                .push((from.to_string(), message.kind.clone()));
        };
        (Arc::new(handler), seen)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio_timeout_test(30, paused)]
    async fn failed_peer_is_removed_after_grace_period() {
        let network = LoopbackNetwork::new();
        let manager = PeerConnectionManager::new(Arc::new(network.factory("hub")), 16);
        let (handler, _) = recording_handler();
        let lobby = LobbySessionController::new("hub", manager, handler, Duration::from_secs(3));
        let remote = PeerConnectionManager::new(Arc::new(network.factory("lane")), 16);

        let offer = lobby.on_peer_discovered(&"lane".into()).await.expect("offer");
        let answer = remote
            .handle_offer_and_create_answer(&"hub".into(), &offer)
            .await
            .expect("answer");
        lobby
            .manager()
            .handle_answer(&"lane".into(), &answer)
            .await
            .expect("apply");
        settle().await;
        assert_eq!(
            lobby.peer(&"lane".into()).map(|entry| entry.state),
            Some(PeerConnectionState::Connected)
        );

        network.set_state("hub", "lane", PeerConnectionState::Failed);
        settle().await;
        assert_eq!(
            lobby.peer(&"lane".into()).map(|entry| entry.state),
            Some(PeerConnectionState::Failed)
        );

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        settle().await;
        assert!(lobby.peer(&"lane".into()).is_some(), "removed too early");

        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;
        assert!(lobby.peer(&"lane".into()).is_none());
        assert!(lobby.manager().peers().is_empty());
    }

    #[tokio_timeout_test(30, paused)]
    async fn recovered_peer_is_kept() {
        let network = LoopbackNetwork::manual_open();
        let manager = PeerConnectionManager::new(Arc::new(network.factory("hub")), 16);
        let (handler, _) = recording_handler();
        let lobby = LobbySessionController::new("hub", manager, handler, Duration::from_secs(3));

        lobby.on_peer_discovered(&"lane".into()).await.expect("offer");
        network.set_state("hub", "lane", PeerConnectionState::Failed);
        settle().await;
        assert!(lobby.peer(&"lane".into()).is_some());

        tokio::time::sleep(Duration::from_secs(1)).await;
        lobby.on_peer_discovered(&"lane".into()).await.expect("re-offer");
        settle().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(
            lobby.peer(&"lane".into()).map(|entry| entry.state),
            Some(PeerConnectionState::New)
        );
    }

    #[tokio::test]
    async fn messages_reach_the_handler_and_player_info_updates_registry() {
        let network = LoopbackNetwork::new();
        let manager = PeerConnectionManager::new(Arc::new(network.factory("hub")), 16);
        let (handler, seen) = recording_handler();
        let lobby = LobbySessionController::new("hub", manager, handler, Duration::from_secs(3));
        let remote = PeerConnectionManager::new(Arc::new(network.factory("lane")), 16);

        let offer = lobby.on_peer_discovered(&"lane".into()).await.expect("offer");
        let answer = remote
            .handle_offer_and_create_answer(&"hub".into(), &offer)
            .await
            .expect("answer");
        lobby
            .manager()
            .handle_answer(&"lane".into(), &answer)
            .await
            .expect("apply");

        let hub = PeerId::from("hub");
        let info = serde_json::to_string(&LobbyMessage::player_info("Lane 4", true)).expect("json");
        remote.send_message(&hub, "not json").await.expect("send");
        remote.send_message(&hub, r#"{"no":"type"}"#).await.expect("send");
        remote.send_message(&hub, &info).await.expect("send");
        remote
            .send_message(&hub, r#"{"type":"race-start","at":1700000000000}"#)
            .await
            .expect("send");
        settle().await;

        let kinds: Vec<String> = seen
            .lock()
            .expect("lock")
            .iter()
            .map(|(from, kind)| {
                assert_eq!(from, "lane");
                kind.clone()
            })
            .collect();
        assert_eq!(kinds, vec!["player-info", "race-start"]);
        let entry = lobby.peer(&"lane".into()).expect("entry");
        assert_eq!(entry.display_name.as_deref(), Some("Lane 4"));
        assert!(entry.ready);
    }
}
