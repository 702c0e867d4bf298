//! Lobby membership and signaling through the presence store.
//!
//! Layout under `lobby/{session}`:
//! * `peers/{id}`: `{ "name", "ready" }`, removed when the device disconnects
//! * `signals/{to}/{seq}-{from}`: one offer, answer, or candidate, deleted by
//!   the recipient once consumed. `seq` is zero-padded so keys sort in send
//!   order per sender.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use presence_store::{PresenceStore, SessionHandle};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::controller::{LobbyInner, LobbySessionController};
use super::{LobbyError, LobbyMessage, PeerEntry, PlayerProfile};
use crate::peer::{IceCandidate, PeerError, PeerId};
use crate::transport::SessionId;

/// Candidates held per peer while its offer has not arrived yet.
const MAX_ORPHAN_CANDIDATES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceSignal {
    pub from: PeerId,
    pub kind: SignalKind,
    pub payload: Value,
}

pub(super) struct Presence {
    shared: Arc<PresenceShared>,
    tasks: Vec<JoinHandle<()>>,
}

impl Presence {
    /// Stop watching and drop this device's presence entries.
    pub(super) fn shut_down(self) {
        for task in self.tasks {
            task.abort();
        }
        self.shared.store.disconnect(self.shared.session);
    }
}

struct PresenceShared {
    store: Arc<dyn PresenceStore>,
    session: SessionHandle,
    lobby_path: String,
    local_id: PeerId,
    profile: RwLock<PlayerProfile>,
    next_seq: AtomicU64,
    /// Candidates that arrived before the sender's offer.
    orphans: Mutex<HashMap<PeerId, Vec<IceCandidate>>>,
}

impl PresenceShared {
    fn self_path(&self) -> String {
        format!("{}/peers/{}", self.lobby_path, self.local_id)
    }

    fn inbox_path(&self) -> String {
        format!("{}/signals/{}", self.lobby_path, self.local_id)
    }

    fn publish_profile(&self) -> Result<(), LobbyError> {
        let profile = self.profile.read().clone();
        self.store.set(
            &self.self_path(),
            json!({ "name": profile.name, "ready": profile.ready }),
        )?;
        Ok(())
    }

    fn send_signal(&self, to: &PeerId, kind: SignalKind, payload: Value) -> Result<(), LobbyError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let path = format!(
            "{}/signals/{}/{seq:010}-{}",
            self.lobby_path, to, self.local_id
        );
        let signal = PresenceSignal {
            from: self.local_id.clone(),
            kind,
            payload,
        };
        self.store.set(&path, serde_json::to_value(&signal)?)?;
        Ok(())
    }
}

impl LobbySessionController {
    /// Publish this device in `lobby/{session_id}` and connect to everyone
    /// listed there. Of each pair, the peer with the smaller id offers.
    pub fn join(
        &self,
        store: Arc<dyn PresenceStore>,
        session_id: &SessionId,
        profile: PlayerProfile,
    ) -> Result<(), LobbyError> {
        let mut presence = self.inner.presence.lock();
        if presence.is_some() {
            return Err(LobbyError::AlreadyJoined);
        }
        let session = store.open_session();
        let shared = Arc::new(PresenceShared {
            store: Arc::clone(&store),
            session,
            lobby_path: format!("lobby/{session_id}"),
            local_id: self.inner.local_id.clone(),
            profile: RwLock::new(profile),
            next_seq: AtomicU64::new(1),
            orphans: Mutex::new(HashMap::new()),
        });
        let joined = (|| {
            shared.publish_profile()?;
            store.on_disconnect_remove(session, &shared.self_path())?;
            store.on_disconnect_remove(session, &shared.inbox_path())?;
            let peers = store.on_value(&format!("{}/peers", shared.lobby_path))?;
            let inbox = store.on_value(&shared.inbox_path())?;
            Ok::<_, LobbyError>((peers, inbox))
        })();
        let (peers, inbox) = match joined {
            Ok(watchers) => watchers,
            Err(err) => {
                store.disconnect(session);
                return Err(err);
            }
        };
        info!(
            target = "motion_bridge::lobby",
            session = %session_id,
            local = %self.inner.local_id,
            "joined lobby"
        );
        let weak = Arc::downgrade(&self.inner);
        let tasks = vec![
            tokio::spawn(watch_peers(weak.clone(), Arc::clone(&shared), peers)),
            tokio::spawn(watch_signals(weak, Arc::clone(&shared), inbox)),
        ];
        *presence = Some(Presence { shared, tasks });
        Ok(())
    }

    /// Leave the lobby: presence entries go away, every connection closes,
    /// and the registry empties. Safe to call when not joined.
    pub async fn leave(&self) {
        let presence = self.inner.presence.lock().take();
        if let Some(presence) = presence {
            presence.shut_down();
        }
        self.cancel_all_removals();
        self.inner.registry.write().clear();
        self.inner.manager.close_all_connections().await;
        info!(target = "motion_bridge::lobby", local = %self.inner.local_id, "left lobby");
    }

    /// Update the published profile and tell connected peers.
    pub async fn set_profile(&self, profile: PlayerProfile) -> Result<usize, LobbyError> {
        let shared = self.presence_shared();
        if let Some(shared) = shared {
            *shared.profile.write() = profile.clone();
            shared.publish_profile()?;
        }
        self.broadcast(&LobbyMessage::player_info(&profile.name, profile.ready))
            .await
    }

    pub(super) fn profile(&self) -> Option<PlayerProfile> {
        self.presence_shared()
            .map(|shared| shared.profile.read().clone())
    }

    pub(super) fn forward_candidate(&self, peer_id: &PeerId, candidate: IceCandidate) {
        let Some(shared) = self.presence_shared() else {
            return;
        };
        let payload = match serde_json::to_value(&candidate) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target = "motion_bridge::lobby", error = %err, "unencodable candidate");
                return;
            }
        };
        if let Err(err) = shared.send_signal(peer_id, SignalKind::Candidate, payload) {
            warn!(
                target = "motion_bridge::lobby",
                peer = %peer_id,
                error = %err,
                "failed to forward candidate"
            );
        }
    }

    /// Candidates held for `peer_id` until its offer arrives.
    pub fn held_candidates(&self, peer_id: &PeerId) -> usize {
        self.presence_shared()
            .and_then(|shared| shared.orphans.lock().get(peer_id).map(Vec::len))
            .unwrap_or(0)
    }

    fn presence_shared(&self) -> Option<Arc<PresenceShared>> {
        self.inner
            .presence
            .lock()
            .as_ref()
            .map(|presence| Arc::clone(&presence.shared))
    }

    fn apply_presence_info(&self, peer_id: &PeerId, info: &Value) {
        let mut registry = self.inner.registry.write();
        let Some(entry) = registry.get_mut(peer_id) else {
            return;
        };
        if let Some(name) = info.get("name").and_then(Value::as_str) {
            entry.display_name = Some(name.to_string());
        }
        if let Some(ready) = info.get("ready").and_then(Value::as_bool) {
            entry.ready = ready;
        }
    }

    async fn on_presence_joined(&self, shared: &PresenceShared, peer_id: &PeerId) {
        self.inner
            .registry
            .write()
            .entry(peer_id.clone())
            .or_insert_with(|| PeerEntry::new(Instant::now()));
        if self.inner.local_id < *peer_id {
            match self.on_peer_discovered(peer_id).await {
                Ok(offer) => {
                    if let Err(err) = shared.send_signal(peer_id, SignalKind::Offer, Value::String(offer)) {
                        warn!(
                            target = "motion_bridge::lobby",
                            peer = %peer_id,
                            error = %err,
                            "failed to publish offer"
                        );
                    }
                }
                Err(err) => warn!(
                    target = "motion_bridge::lobby",
                    peer = %peer_id,
                    error = %err,
                    "failed to start connection"
                ),
            }
        } else {
            debug!(
                target = "motion_bridge::lobby",
                peer = %peer_id,
                "waiting for peer to offer"
            );
        }
    }

    async fn on_presence_left(&self, shared: &PresenceShared, peer_id: &PeerId) {
        info!(target = "motion_bridge::lobby", peer = %peer_id, "peer left lobby");
        let held = shared.orphans.lock().remove(peer_id);
        if let Some(held) = held {
            debug!(
                target = "motion_bridge::lobby",
                peer = %peer_id,
                dropped = held.len(),
                "discarding candidates held for departed peer"
            );
        }
        self.cancel_removal(peer_id);
        self.inner.registry.write().remove(peer_id);
        self.inner.manager.close_connection(peer_id).await;
    }

    async fn apply_signal(
        &self,
        shared: &PresenceShared,
        signal: PresenceSignal,
    ) {
        let from = signal.from;
        let manager = &self.inner.manager;
        let result = match signal.kind {
            SignalKind::Offer => {
                let Some(offer) = signal.payload.as_str() else {
                    warn!(target = "motion_bridge::lobby", peer = %from, "offer without sdp");
                    return;
                };
                match manager.handle_offer_and_create_answer(&from, offer).await {
                    Ok(answer) => {
                        let held = shared.orphans.lock().remove(&from).unwrap_or_default();
                        for candidate in held {
                            if let Err(err) = manager.add_ice_candidate(&from, candidate).await {
                                debug!(
                                    target = "motion_bridge::lobby",
                                    peer = %from,
                                    error = %err,
                                    "held candidate rejected"
                                );
                            }
                        }
                        shared.send_signal(&from, SignalKind::Answer, Value::String(answer))
                    }
                    Err(err) => Err(err.into()),
                }
            }
            SignalKind::Answer => {
                let Some(answer) = signal.payload.as_str() else {
                    warn!(target = "motion_bridge::lobby", peer = %from, "answer without sdp");
                    return;
                };
                manager.handle_answer(&from, answer).await.map_err(Into::into)
            }
            SignalKind::Candidate => {
                let candidate: IceCandidate = match serde_json::from_value(signal.payload) {
                    Ok(candidate) => candidate,
                    Err(err) => {
                        warn!(
                            target = "motion_bridge::lobby",
                            peer = %from,
                            error = %err,
                            "malformed candidate"
                        );
                        return;
                    }
                };
                match manager.add_ice_candidate(&from, candidate.clone()).await {
                    Err(PeerError::UnknownPeer(_)) => {
                        let mut orphans = shared.orphans.lock();
                        let held = orphans.entry(from.clone()).or_default();
                        if held.len() < MAX_ORPHAN_CANDIDATES {
                            held.push(candidate);
                        }
                        Ok(())
                    }
                    other => other.map_err(Into::into),
                }
            }
        };
        if let Err(err) = result {
            warn!(
                target = "motion_bridge::lobby",
                peer = %from,
                error = %err,
                "failed to apply signal"
            );
        }
    }
}

async fn watch_peers(
    inner: Weak<LobbyInner>,
    shared: Arc<PresenceShared>,
    mut peers: watch::Receiver<Option<Value>>,
) {
    let mut known: HashSet<PeerId> = HashSet::new();
    loop {
        let listed: BTreeMap<PeerId, Value> = peers
            .borrow_and_update()
            .as_ref()
            .and_then(Value::as_object)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(id, info)| (PeerId::from(id.as_str()), info.clone()))
                    .filter(|(id, _)| *id != shared.local_id)
                    .collect()
            })
            .unwrap_or_default();
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let lobby = LobbySessionController { inner };

        for (peer_id, info) in &listed {
            if !known.contains(peer_id) {
                lobby.on_presence_joined(&shared, peer_id).await;
            }
            lobby.apply_presence_info(peer_id, info);
        }
        let departed: Vec<PeerId> = known
            .iter()
            .filter(|id| !listed.contains_key(*id))
            .cloned()
            .collect();
        for peer_id in departed {
            lobby.on_presence_left(&shared, &peer_id).await;
        }
        known = listed.into_keys().collect();
        drop(lobby);

        if peers.changed().await.is_err() {
            break;
        }
    }
}

async fn watch_signals(
    inner: Weak<LobbyInner>,
    shared: Arc<PresenceShared>,
    mut inbox: watch::Receiver<Option<Value>>,
) {
    loop {
        let mut pending: Vec<(String, Value)> = inbox
            .borrow_and_update()
            .as_ref()
            .and_then(Value::as_object)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();
        pending.sort_by(|a, b| a.0.cmp(&b.0));
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let lobby = LobbySessionController { inner };

        for (key, value) in pending {
            // Consume before applying so a later snapshot never replays it.
            if let Err(err) = shared.store.remove(&format!("{}/{key}", shared.inbox_path())) {
                warn!(target = "motion_bridge::lobby", key = %key, error = %err, "failed to consume signal");
            }
            match serde_json::from_value::<PresenceSignal>(value) {
                Ok(signal) => lobby.apply_signal(&shared, signal).await,
                Err(err) => warn!(
                    target = "motion_bridge::lobby",
                    key = %key,
                    error = %err,
                    "dropping malformed signal"
                ),
            }
        }
        drop(lobby);

        if inbox.changed().await.is_err() {
            break;
        }
    }
}
