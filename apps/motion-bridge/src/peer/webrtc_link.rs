use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock as AsyncRwLock, mpsc};
use tracing::{debug, trace, warn};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{
    IceCandidate, LinkEvent, PeerConnectionState, PeerError, PeerId, PeerLink, PeerLinkFactory,
};

#[derive(Debug, Clone)]
pub struct RtcSettings {
    /// STUN/TURN urls; empty means host candidates only.
    pub ice_servers: Vec<String>,
    pub channel_label: String,
}

/// Real peer connections. Offers and answers are returned only after ICE
/// gathering completes, so every candidate is already in the SDP and the
/// short-range link needs exactly one exchange.
pub struct WebRtcLinkFactory {
    api: API,
    settings: RtcSettings,
}

impl WebRtcLinkFactory {
    pub fn new(settings: RtcSettings) -> Self {
        Self {
            api: APIBuilder::new().build(),
            settings,
        }
    }
}

#[async_trait]
impl PeerLinkFactory for WebRtcLinkFactory {
    async fn open(
        &self,
        peer_id: &PeerId,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, PeerError> {
        let ice_servers = if self.settings.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.settings.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(rtc_config).await?);

        let state_events = events.clone();
        let state_peer = peer_id.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            let peer = state_peer.clone();
            Box::pin(async move {
                trace!(target = "motion_bridge::peer::webrtc", peer = %peer, ?state, "rtc state");
                if let Some(state) = map_state(state) {
                    let _ = events.send(LinkEvent::StateChanged(state));
                }
            })
        }));

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(LinkEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(err) => warn!(
                        target = "motion_bridge::peer::webrtc",
                        error = %err,
                        "failed to serialize local candidate"
                    ),
                }
            })
        }));

        let channel = Arc::new(AsyncRwLock::new(None));
        let incoming_slot = Arc::clone(&channel);
        let incoming_events = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let slot = Arc::clone(&incoming_slot);
            let events = incoming_events.clone();
            Box::pin(async move {
                debug!(
                    target = "motion_bridge::peer::webrtc",
                    label = %dc.label(),
                    "remote data channel announced"
                );
                attach_channel(&dc, &events);
                *slot.write().await = Some(dc);
            })
        }));

        Ok(Arc::new(WebRtcLink {
            peer_id: peer_id.clone(),
            pc,
            channel,
            events,
            label: self.settings.channel_label.clone(),
        }))
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    match state {
        RTCPeerConnectionState::Unspecified => None,
        RTCPeerConnectionState::New => Some(PeerConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
    }
}

fn attach_channel(dc: &Arc<RTCDataChannel>, events: &mpsc::UnboundedSender<LinkEvent>) {
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            let _ = open_events.send(LinkEvent::ChannelOpen);
        })
    }));

    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        let events = close_events.clone();
        Box::pin(async move {
            let _ = events.send(LinkEvent::ChannelClosed);
        })
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = events.send(LinkEvent::Message(text));
                }
                Err(_) => warn!(
                    target = "motion_bridge::peer::webrtc",
                    len = msg.data.len(),
                    binary = !msg.is_string,
                    "dropping non-utf8 data channel message"
                ),
            }
        })
    }));
}

struct WebRtcLink {
    peer_id: PeerId,
    pc: Arc<RTCPeerConnection>,
    channel: Arc<AsyncRwLock<Option<Arc<RTCDataChannel>>>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    label: String,
}

impl WebRtcLink {
    async fn gathered_local_sdp(&self, description: RTCSessionDescription) -> Result<String, PeerError> {
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(description).await?;
        let _ = gathered.recv().await;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| PeerError::Link("local description missing after gathering".into()))?;
        Ok(local.sdp)
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> Result<String, PeerError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(&self.label, Some(init)).await?;
        attach_channel(&dc, &self.events);
        *self.channel.write().await = Some(dc);

        let offer = self.pc.create_offer(None).await?;
        let sdp = self.gathered_local_sdp(offer).await?;
        debug!(
            target = "motion_bridge::peer::webrtc",
            peer = %self.peer_id,
            len = sdp.len(),
            "offer gathered"
        );
        Ok(sdp)
    }

    async fn accept_offer(&self, offer: &str) -> Result<String, PeerError> {
        let remote = RTCSessionDescription::offer(offer.to_string())
            .map_err(|err| PeerError::InvalidDescription(err.to_string()))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|err| PeerError::InvalidDescription(err.to_string()))?;
        let answer = self.pc.create_answer(None).await?;
        self.gathered_local_sdp(answer).await
    }

    async fn apply_answer(&self, answer: &str) -> Result<(), PeerError> {
        let remote = RTCSessionDescription::answer(answer.to_string())
            .map_err(|err| PeerError::InvalidDescription(err.to_string()))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|err| PeerError::InvalidDescription(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<(), PeerError> {
        let channel = self.channel.read().await.clone();
        let dc = channel.ok_or_else(|| PeerError::Link("data channel not created".into()))?;
        dc.send_text(text.to_string()).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            warn!(
                target = "motion_bridge::peer::webrtc",
                peer = %self.peer_id,
                error = %err,
                "error closing peer connection"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtc_states_map_onto_peer_states() {
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), None);
        assert_eq!(
            map_state(RTCPeerConnectionState::Failed),
            Some(PeerConnectionState::Failed)
        );
        assert_eq!(
            map_state(RTCPeerConnectionState::Disconnected),
            Some(PeerConnectionState::Disconnected)
        );
    }

    #[tokio::test]
    async fn garbage_offer_is_rejected_as_invalid_description() {
        let factory = WebRtcLinkFactory::new(RtcSettings {
            ice_servers: Vec::new(),
            channel_label: "motion-data".into(),
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = factory.open(&"remote".into(), tx).await.expect("open");
        let err = link.accept_offer("not sdp").await.expect_err("invalid");
        assert!(matches!(err, PeerError::InvalidDescription(_)));
        link.close().await;
    }
}
