use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use signal_chunk::{ChunkError, EnvelopeKind, ReassemblyBuffer};
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::{
    INITIATOR_PEER_KEY, Negotiator, RESPONDER_PEER_KEY, SignalingConfig, SignalingError,
    SignalingEvent,
};
use crate::transport::{
    AdvertiserEvent, AdvertiserSession, CentralEvent, CentralLink, CentralSession,
    MAX_WRITE_BYTES, PeripheralLink, SessionId, ShortRangeTransport,
};

const EVENT_CAPACITY: usize = 256;
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct SignalingService {
    inner: Arc<Inner>,
}

struct Inner {
    config: SignalingConfig,
    radio: Arc<dyn ShortRangeTransport>,
    reassembly: Mutex<ReassemblyBuffer>,
    responder: AsyncMutex<Option<ResponderState>>,
    initiator: AsyncMutex<Option<InitiatorState>>,
    next_attempt: AtomicU64,
    events: broadcast::Sender<SignalingEvent>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

struct ResponderState {
    session_id: SessionId,
    link: Arc<dyn PeripheralLink>,
    pump: JoinHandle<()>,
}

struct InitiatorState {
    attempt: u64,
    link: Arc<dyn CentralLink>,
    pump: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
        if let Some(state) = self.responder.get_mut().take() {
            state.pump.abort();
        }
        if let Some(state) = self.initiator.get_mut().take() {
            state.pump.abort();
        }
    }
}

impl SignalingService {
    pub fn new(radio: Arc<dyn ShortRangeTransport>, config: SignalingConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                radio,
                reassembly: Mutex::new(ReassemblyBuffer::new(config.chunk)),
                responder: AsyncMutex::new(None),
                initiator: AsyncMutex::new(None),
                next_attempt: AtomicU64::new(1),
                events,
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.inner.events.subscribe()
    }

    /// Session currently advertised by the responder role, if any.
    pub async fn responder_session(&self) -> Option<SessionId> {
        self.inner
            .responder
            .lock()
            .await
            .as_ref()
            .map(|state| state.session_id.clone())
    }

    /// Advertise `session_id` and answer the first complete offer through
    /// `negotiator`. Returns once advertising has started.
    pub async fn start_responder_handshake(
        &self,
        session_id: &SessionId,
        negotiator: Arc<dyn Negotiator>,
    ) -> Result<(), SignalingError> {
        self.ensure_sweeper();
        let mut responder = self.inner.responder.lock().await;
        if let Some(state) = responder.as_ref() {
            if state.session_id == *session_id && !state.pump.is_finished() {
                debug!(
                    target = "motion_bridge::signaling",
                    session = %session_id,
                    "already advertising this session"
                );
                return Ok(());
            }
        }
        if let Some(previous) = responder.take() {
            info!(
                target = "motion_bridge::signaling",
                previous = %previous.session_id,
                session = %session_id,
                "switching advertised session"
            );
            previous.pump.abort();
            previous.link.stop().await;
        }

        let AdvertiserSession { link, events } =
            self.inner.radio.start_advertising(session_id).await?;
        let name = link.advertised_name().to_string();
        info!(
            target = "motion_bridge::signaling",
            session = %session_id,
            name = %name,
            "responder advertising"
        );
        self.inner.emit(SignalingEvent::Advertising {
            session_id: session_id.clone(),
            name,
        });
        let pump = tokio::spawn(run_responder(
            Arc::downgrade(&self.inner),
            Arc::clone(&link),
            events,
            negotiator,
        ));
        *responder = Some(ResponderState {
            session_id: session_id.clone(),
            link,
            pump,
        });
        Ok(())
    }

    /// Find the advertiser for `session_id`, send an offer, and apply the
    /// answer. Resolves when the answer is applied or the attempt fails.
    pub async fn start_initiator_handshake(
        &self,
        session_id: &SessionId,
        negotiator: Arc<dyn Negotiator>,
    ) -> Result<(), SignalingError> {
        self.ensure_sweeper();
        let CentralSession { link, name, events } = self
            .inner
            .radio
            .scan_and_connect(session_id, self.inner.config.scan_timeout)
            .await
            .map_err(SignalingError::Discovery)?;
        info!(
            target = "motion_bridge::signaling",
            session = %session_id,
            name = %name,
            "connected to responder"
        );
        self.inner
            .emit(SignalingEvent::PeripheralConnected { name });

        let attempt = self.inner.next_attempt.fetch_add(1, Ordering::Relaxed);
        let (answer_tx, answer_rx) = oneshot::channel();
        let pump = tokio::spawn(run_initiator(
            Arc::downgrade(&self.inner),
            events,
            answer_tx,
        ));
        let previous = self.inner.initiator.lock().await.replace(InitiatorState {
            attempt,
            link: Arc::clone(&link),
            pump,
        });
        if let Some(previous) = previous {
            previous.pump.abort();
            previous.link.disconnect().await;
        }
        self.inner.reset_link(INITIATOR_PEER_KEY);

        let result = self
            .negotiate_as_initiator(link.as_ref(), negotiator.as_ref(), answer_rx)
            .await;
        match &result {
            Ok(()) => {
                info!(
                    target = "motion_bridge::signaling",
                    session = %session_id,
                    "answer applied"
                );
                self.inner.emit(SignalingEvent::AnswerApplied);
            }
            Err(err) => {
                warn!(
                    target = "motion_bridge::signaling",
                    session = %session_id,
                    error = %err,
                    "initiator handshake failed"
                );
                let mut initiator = self.inner.initiator.lock().await;
                if initiator.as_ref().is_some_and(|state| state.attempt == attempt) {
                    if let Some(state) = initiator.take() {
                        state.pump.abort();
                        state.link.disconnect().await;
                    }
                }
            }
        }
        result
    }

    async fn negotiate_as_initiator(
        &self,
        link: &dyn CentralLink,
        negotiator: &dyn Negotiator,
        answer_rx: oneshot::Receiver<String>,
    ) -> Result<(), SignalingError> {
        let offer = negotiator.create_offer_with_data_channel().await?;
        let frames = wire_frames(
            EnvelopeKind::Offer,
            &offer,
            self.inner.config.chunk.max_envelope_bytes,
        )?;
        debug!(
            target = "motion_bridge::signaling",
            len = offer.len(),
            envelopes = frames.len(),
            "writing offer"
        );
        for frame in frames {
            link.write(frame).await?;
        }

        let answer_timeout = self.inner.config.answer_timeout;
        let answer = match tokio::time::timeout(answer_timeout, answer_rx).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => return Err(SignalingError::LinkClosed),
            Err(_) => return Err(SignalingError::AnswerTimeout(answer_timeout)),
        };
        negotiator.set_remote_answer(&answer).await?;
        Ok(())
    }

    /// Chunk `text` as a lobby message over whichever role is active.
    pub async fn send_lobby_message(&self, text: &str) -> Result<(), SignalingError> {
        let frames = wire_frames(
            EnvelopeKind::LobbyMessage,
            text,
            self.inner.config.chunk.max_envelope_bytes,
        )?;
        let central = self
            .inner
            .initiator
            .lock()
            .await
            .as_ref()
            .map(|state| Arc::clone(&state.link));
        if let Some(link) = central {
            for frame in frames {
                link.write(frame).await?;
            }
            return Ok(());
        }
        let peripheral = self
            .inner
            .responder
            .lock()
            .await
            .as_ref()
            .map(|state| Arc::clone(&state.link));
        if let Some(link) = peripheral {
            for frame in frames {
                link.notify(frame).await?;
            }
            return Ok(());
        }
        Err(SignalingError::NotConnected)
    }

    /// Stop advertising, disconnect, and drop the sweep task.
    pub async fn stop(&self) {
        if let Some(state) = self.inner.responder.lock().await.take() {
            state.pump.abort();
            state.link.stop().await;
        }
        if let Some(state) = self.inner.initiator.lock().await.take() {
            state.pump.abort();
            state.link.disconnect().await;
        }
        if let Some(sweeper) = self.inner.sweeper.lock().take() {
            sweeper.abort();
        }
        debug!(target = "motion_bridge::signaling", "signaling stopped");
    }

    fn ensure_sweeper(&self) {
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let period = (self.inner.config.chunk.reassembly_timeout / 2).max(MIN_SWEEP_PERIOD);
        let weak = Arc::downgrade(&self.inner);
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let dropped = inner.reassembly.lock().sweep(now());
                for event in dropped {
                    debug!(
                        target = "motion_bridge::signaling",
                        peer_key = %event.peer_key,
                        kind = ?event.kind,
                        "partial message swept"
                    );
                }
            }
        }));
    }
}

impl Inner {
    fn emit(&self, event: SignalingEvent) {
        let _ = self.events.send(event);
    }

    fn ingest(&self, peer_key: &str, bytes: &[u8]) -> Option<(EnvelopeKind, String)> {
        self.reassembly.lock().ingest_wire(peer_key, bytes, now())
    }

    /// Partials from a previous link must not complete with the next link's envelopes.
    fn reset_link(&self, peer_key: &str) {
        for event in self.reassembly.lock().forget(peer_key) {
            debug!(
                target = "motion_bridge::signaling",
                peer_key = %event.peer_key,
                kind = ?event.kind,
                "dropped partial from previous link"
            );
        }
    }

    async fn answer_offer(
        &self,
        link: &dyn PeripheralLink,
        negotiator: &dyn Negotiator,
        offer: String,
        answered: &mut Option<(String, String)>,
    ) {
        self.emit(SignalingEvent::OfferReceived { len: offer.len() });
        let cached = answered
            .as_ref()
            .filter(|(previous, _)| *previous == offer)
            .map(|(_, answer)| answer.clone());
        let answer = match cached {
            Some(answer) => {
                debug!(
                    target = "motion_bridge::signaling",
                    "offer already answered; resending answer"
                );
                answer
            }
            None => match negotiator.accept_offer_and_create_answer(&offer).await {
                Ok(answer) => {
                    *answered = Some((offer, answer.clone()));
                    answer
                }
                Err(err) => {
                    warn!(
                        target = "motion_bridge::signaling",
                        error = %err,
                        "failed to answer offer"
                    );
                    self.emit(SignalingEvent::HandshakeFailed {
                        reason: err.to_string(),
                    });
                    return;
                }
            },
        };

        match self.notify_answer(link, &answer).await {
            Ok(envelopes) => self.emit(SignalingEvent::AnswerSent { envelopes }),
            Err(err) => {
                warn!(
                    target = "motion_bridge::signaling",
                    error = %err,
                    "failed to send answer"
                );
                self.emit(SignalingEvent::HandshakeFailed {
                    reason: err.to_string(),
                });
            }
        }
    }

    async fn notify_answer(
        &self,
        link: &dyn PeripheralLink,
        answer: &str,
    ) -> Result<usize, SignalingError> {
        let frames = wire_frames(
            EnvelopeKind::Answer,
            answer,
            self.config.chunk.max_envelope_bytes,
        )?;
        let count = frames.len();
        for frame in frames {
            link.notify(frame).await?;
        }
        Ok(count)
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Serialized frames that each fit one radio write. JSON escaping can grow
/// `data` up to sixfold, so the data budget halves until every frame fits.
fn wire_frames(
    kind: EnvelopeKind,
    payload: &str,
    max_envelope_bytes: usize,
) -> Result<Vec<Bytes>, ChunkError> {
    let mut budget = max_envelope_bytes.max(1);
    loop {
        let frames = signal_chunk::encode(kind, payload, budget)?
            .iter()
            .map(|envelope| envelope.to_wire().map(Bytes::from))
            .collect::<Result<Vec<_>, _>>()?;
        if budget == 1 || frames.iter().all(|frame| frame.len() <= MAX_WRITE_BYTES) {
            return Ok(frames);
        }
        budget /= 2;
        trace!(
            target = "motion_bridge::signaling",
            budget,
            "escaped envelopes exceed one write; shrinking data budget"
        );
    }
}

async fn run_responder(
    inner: Weak<Inner>,
    link: Arc<dyn PeripheralLink>,
    mut events: mpsc::UnboundedReceiver<AdvertiserEvent>,
    negotiator: Arc<dyn Negotiator>,
) {
    let mut answered: Option<(String, String)> = None;
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            AdvertiserEvent::CentralConnected { address } => {
                inner.reset_link(RESPONDER_PEER_KEY);
                info!(
                    target = "motion_bridge::signaling",
                    central = %address,
                    "central connected"
                );
                inner.emit(SignalingEvent::CentralConnected { address });
            }
            AdvertiserEvent::CentralDisconnected { address } => {
                inner.reset_link(RESPONDER_PEER_KEY);
                info!(
                    target = "motion_bridge::signaling",
                    central = %address,
                    "central disconnected"
                );
                inner.emit(SignalingEvent::CentralDisconnected { address });
            }
            AdvertiserEvent::Write(bytes) => {
                let Some((kind, payload)) = inner.ingest(RESPONDER_PEER_KEY, &bytes) else {
                    continue;
                };
                match kind {
                    EnvelopeKind::Offer => {
                        inner
                            .answer_offer(link.as_ref(), negotiator.as_ref(), payload, &mut answered)
                            .await
                    }
                    EnvelopeKind::LobbyMessage => {
                        inner.emit(SignalingEvent::LobbyMessage { text: payload })
                    }
                    EnvelopeKind::Answer => debug!(
                        target = "motion_bridge::signaling",
                        "responder ignoring answer envelope"
                    ),
                }
            }
        }
    }
}

async fn run_initiator(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<CentralEvent>,
    answer_tx: oneshot::Sender<String>,
) {
    let mut answer_tx = Some(answer_tx);
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            CentralEvent::Notification(bytes) => {
                let Some((kind, payload)) = inner.ingest(INITIATOR_PEER_KEY, &bytes) else {
                    continue;
                };
                match kind {
                    EnvelopeKind::Answer => match answer_tx.take() {
                        Some(tx) => {
                            let _ = tx.send(payload);
                        }
                        None => debug!(
                            target = "motion_bridge::signaling",
                            "ignoring duplicate answer"
                        ),
                    },
                    EnvelopeKind::LobbyMessage => {
                        inner.emit(SignalingEvent::LobbyMessage { text: payload })
                    }
                    EnvelopeKind::Offer => debug!(
                        target = "motion_bridge::signaling",
                        "initiator ignoring offer envelope"
                    ),
                }
            }
            CentralEvent::Disconnected => {
                info!(target = "motion_bridge::signaling", "responder went away");
                inner.emit(SignalingEvent::PeripheralDisconnected);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_chunk::ChunkConfig;

    #[test]
    fn sdp_frames_fit_one_write() {
        let sdp = "a=candidate:1 1 udp 2122260223 192.168.1.20 50000 typ host\r\n".repeat(40);
        let frames = wire_frames(EnvelopeKind::Offer, &sdp, 180).expect("frames");
        assert_eq!(frames.len(), sdp.len().div_ceil(180));
        assert!(frames.iter().all(|frame| frame.len() <= MAX_WRITE_BYTES));
    }

    #[test]
    fn escaped_control_characters_still_fit_one_write() {
        let text: String = std::iter::repeat_n('\u{1}', 400).collect();
        let frames = wire_frames(EnvelopeKind::LobbyMessage, &text, 180).expect("frames");
        assert!(frames.iter().all(|frame| frame.len() <= MAX_WRITE_BYTES));

        let mut buffer = ReassemblyBuffer::new(ChunkConfig::default());
        let now = Instant::now();
        let done: Vec<_> = frames
            .iter()
            .filter_map(|frame| buffer.ingest_wire("central", frame, now))
            .collect();
        assert_eq!(done, vec![(EnvelopeKind::LobbyMessage, text)]);
    }
}
