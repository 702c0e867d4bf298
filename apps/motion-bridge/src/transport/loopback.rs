//! In-process radio: every advertiser and scanner sharing one
//! [`LoopbackRadio`] can see each other, with optional fault injection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, trace};

use super::{
    AdvertiserEvent, AdvertiserSession, CentralEvent, CentralLink, CentralSession,
    DEFAULT_DEVICE_PREFIX, MAX_WRITE_BYTES, PeripheralLink, SessionId, ShortRangeTransport,
    TransportError,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct LinkFaults {
    /// Deliver every write and notification twice.
    pub duplicate_delivery: bool,
}

#[derive(Clone)]
pub struct LoopbackRadio {
    air: Arc<Air>,
}

struct Air {
    prefix: String,
    faults: Mutex<LinkFaults>,
    state: Mutex<AirState>,
    changed: Notify,
    next_id: AtomicU64,
    scans_started: AtomicUsize,
    scans_stopped: AtomicUsize,
}

#[derive(Default)]
struct AirState {
    advertisers: HashMap<String, Advertiser>,
}

struct Advertiser {
    id: u64,
    events: mpsc::UnboundedSender<AdvertiserEvent>,
    central: Option<ConnectedCentral>,
}

struct ConnectedCentral {
    id: u64,
    address: String,
    events: mpsc::UnboundedSender<CentralEvent>,
}

impl Default for LoopbackRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackRadio {
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_DEVICE_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            air: Arc::new(Air {
                prefix: prefix.into(),
                faults: Mutex::new(LinkFaults::default()),
                state: Mutex::new(AirState::default()),
                changed: Notify::new(),
                next_id: AtomicU64::new(1),
                scans_started: AtomicUsize::new(0),
                scans_stopped: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_faults(&self, faults: LinkFaults) {
        *self.air.faults.lock() = faults;
    }

    pub fn scans_started(&self) -> usize {
        self.air.scans_started.load(Ordering::SeqCst)
    }

    pub fn scans_stopped(&self) -> usize {
        self.air.scans_stopped.load(Ordering::SeqCst)
    }

    pub fn active_scans(&self) -> usize {
        self.scans_started() - self.scans_stopped()
    }

    pub fn advertised_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.air.state.lock().advertisers.keys().cloned().collect();
        names.sort();
        names
    }

    fn try_connect(&self, target: &str) -> Option<CentralSession> {
        let mut state = self.air.state.lock();
        let advertiser = state.advertisers.get_mut(target)?;
        if advertiser.central.is_some() {
            trace!(
                target = "motion_bridge::transport",
                name = %target,
                "matching advertiser already has a central"
            );
            return None;
        }
        let id = self.air.next_id.fetch_add(1, Ordering::Relaxed);
        let address = format!("loopback-central-{id}");
        let (tx, rx) = mpsc::unbounded_channel();
        advertiser.central = Some(ConnectedCentral {
            id,
            address: address.clone(),
            events: tx,
        });
        let _ = advertiser.events.send(AdvertiserEvent::CentralConnected {
            address: address.clone(),
        });
        info!(
            target = "motion_bridge::transport",
            name = %target,
            central = %address,
            "central connected"
        );
        Some(CentralSession {
            link: Arc::new(LoopbackCentral {
                air: Arc::clone(&self.air),
                name: target.to_string(),
                id,
                address: format!("loopback-peripheral-{}", advertiser.id),
            }),
            name: target.to_string(),
            events: rx,
        })
    }
}

/// Counts the scan as stopped however the scanning future ends.
struct ScanGuard<'a>(&'a Air);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.scans_stopped.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ShortRangeTransport for LoopbackRadio {
    async fn start_advertising(
        &self,
        session_id: &SessionId,
    ) -> Result<AdvertiserSession, TransportError> {
        let name = session_id.advertised_name(&self.air.prefix);
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.air.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.air.state.lock();
            if state.advertisers.contains_key(&name) {
                return Err(TransportError::AlreadyAdvertising(name));
            }
            state.advertisers.insert(
                name.clone(),
                Advertiser {
                    id,
                    events: tx,
                    central: None,
                },
            );
        }
        self.air.changed.notify_waiters();
        info!(target = "motion_bridge::transport", name = %name, "advertising");
        Ok(AdvertiserSession {
            link: Arc::new(LoopbackPeripheral {
                air: Arc::clone(&self.air),
                name,
                id,
            }),
            events: rx,
        })
    }

    async fn scan_and_connect(
        &self,
        session_id: &SessionId,
        timeout: Duration,
    ) -> Result<CentralSession, TransportError> {
        let target = session_id.advertised_name(&self.air.prefix);
        self.air.scans_started.fetch_add(1, Ordering::SeqCst);
        let _guard = ScanGuard(&self.air);
        let deadline = tokio::time::Instant::now() + timeout;
        debug!(target = "motion_bridge::transport", name = %target, "scan started");
        loop {
            // Registered before the check so an advertiser appearing in
            // between still wakes us.
            let changed = self.air.changed.notified();
            if let Some(session) = self.try_connect(&target) {
                return Ok(session);
            }
            tokio::select! {
                _ = changed => {}
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(target = "motion_bridge::transport", name = %target, "scan timed out");
                    return Err(TransportError::ScanTimeout {
                        session_id: session_id.to_string(),
                        waited_ms: timeout.as_millis() as u64,
                    });
                }
            }
        }
    }
}

struct LoopbackPeripheral {
    air: Arc<Air>,
    name: String,
    id: u64,
}

#[async_trait]
impl PeripheralLink for LoopbackPeripheral {
    fn advertised_name(&self) -> &str {
        &self.name
    }

    async fn notify(&self, bytes: Bytes) -> Result<(), TransportError> {
        if bytes.len() > MAX_WRITE_BYTES {
            return Err(TransportError::PayloadTooLarge {
                len: bytes.len(),
                max: MAX_WRITE_BYTES,
            });
        }
        let duplicate = self.air.faults.lock().duplicate_delivery;
        let state = self.air.state.lock();
        let central = state
            .advertisers
            .get(&self.name)
            .filter(|advertiser| advertiser.id == self.id)
            .and_then(|advertiser| advertiser.central.as_ref())
            .ok_or(TransportError::NotConnected)?;
        let copies = if duplicate { 2 } else { 1 };
        for _ in 0..copies {
            central
                .events
                .send(CentralEvent::Notification(bytes.clone()))
                .map_err(|_| TransportError::NotConnected)?;
        }
        Ok(())
    }

    async fn stop(&self) {
        let removed = {
            let mut state = self.air.state.lock();
            let ours = state
                .advertisers
                .get(&self.name)
                .is_some_and(|advertiser| advertiser.id == self.id);
            if ours {
                state.advertisers.remove(&self.name)
            } else {
                None
            }
        };
        if let Some(advertiser) = removed {
            if let Some(central) = advertiser.central {
                let _ = central.events.send(CentralEvent::Disconnected);
            }
            info!(target = "motion_bridge::transport", name = %self.name, "advertising stopped");
        }
    }
}

struct LoopbackCentral {
    air: Arc<Air>,
    name: String,
    id: u64,
    address: String,
}

#[async_trait]
impl CentralLink for LoopbackCentral {
    fn peer_address(&self) -> &str {
        &self.address
    }

    async fn write(&self, bytes: Bytes) -> Result<(), TransportError> {
        if bytes.len() > MAX_WRITE_BYTES {
            return Err(TransportError::PayloadTooLarge {
                len: bytes.len(),
                max: MAX_WRITE_BYTES,
            });
        }
        let duplicate = self.air.faults.lock().duplicate_delivery;
        let state = self.air.state.lock();
        let advertiser = state
            .advertisers
            .get(&self.name)
            .filter(|advertiser| {
                advertiser
                    .central
                    .as_ref()
                    .is_some_and(|central| central.id == self.id)
            })
            .ok_or(TransportError::NotConnected)?;
        let copies = if duplicate { 2 } else { 1 };
        for _ in 0..copies {
            advertiser
                .events
                .send(AdvertiserEvent::Write(bytes.clone()))
                .map_err(|_| TransportError::NotConnected)?;
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.air.state.lock();
        let Some(advertiser) = state.advertisers.get_mut(&self.name) else {
            return;
        };
        let ours = advertiser
            .central
            .as_ref()
            .is_some_and(|central| central.id == self.id);
        if !ours {
            return;
        }
        if let Some(central) = advertiser.central.take() {
            let _ = advertiser.events.send(AdvertiserEvent::CentralDisconnected {
                address: central.address,
            });
        }
        drop(state);
        // A freed advertiser can be matched by scanners still waiting.
        self.air.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_timeout::tokio_timeout_test;

    fn session(raw: &str) -> SessionId {
        SessionId::parse(raw).expect("session id")
    }

    #[tokio::test]
    async fn scanner_connects_and_exchanges_bytes() {
        let radio = LoopbackRadio::new();
        let mut advertiser = radio
            .start_advertising(&session("ABC123"))
            .await
            .expect("advertise");
        assert_eq!(advertiser.link.advertised_name(), "Motion-ABC123");

        let mut central = radio
            .scan_and_connect(&session("ABC123"), Duration::from_secs(1))
            .await
            .expect("connect");
        assert!(matches!(
            advertiser.events.recv().await,
            Some(AdvertiserEvent::CentralConnected { .. })
        ));

        central.link.write(Bytes::from_static(b"ping")).await.expect("write");
        assert_eq!(
            advertiser.events.recv().await,
            Some(AdvertiserEvent::Write(Bytes::from_static(b"ping")))
        );
        advertiser
            .link
            .notify(Bytes::from_static(b"pong"))
            .await
            .expect("notify");
        assert_eq!(
            central.events.recv().await,
            Some(CentralEvent::Notification(Bytes::from_static(b"pong")))
        );
        assert_eq!(radio.active_scans(), 0);
    }

    #[tokio::test]
    async fn scan_waits_for_late_advertiser() {
        let radio = LoopbackRadio::new();
        let scanner = radio.clone();
        let scan = tokio::spawn(async move {
            scanner
                .scan_and_connect(&session("LATE01"), Duration::from_secs(5))
                .await
        });
        tokio::task::yield_now().await;
        let _advertiser = radio
            .start_advertising(&session("LATE01"))
            .await
            .expect("advertise");
        let central = scan.await.expect("join").expect("connect");
        assert_eq!(central.name, "Motion-LATE01");
    }

    #[tokio_timeout_test(30, paused)]
    async fn scan_times_out_and_stops() {
        let radio = LoopbackRadio::new();
        let err = radio
            .scan_and_connect(&session("NOBODY"), Duration::from_millis(200))
            .await
            .err()
            .expect("timeout");
        assert!(matches!(err, TransportError::ScanTimeout { waited_ms: 200, .. }));
        assert_eq!(radio.scans_started(), 1);
        assert_eq!(radio.active_scans(), 0);
    }

    #[tokio_timeout_test(30, paused)]
    async fn name_must_match_exactly() {
        let radio = LoopbackRadio::new();
        let _advertiser = radio
            .start_advertising(&session("ABC123"))
            .await
            .expect("advertise");
        let err = radio
            .scan_and_connect(&session("ABC"), Duration::from_millis(100))
            .await
            .err()
            .expect("no partial match");
        assert!(matches!(err, TransportError::ScanTimeout { .. }));
    }

    #[tokio_timeout_test(30, paused)]
    async fn second_scanner_is_not_served() {
        let radio = LoopbackRadio::new();
        let _advertiser = radio
            .start_advertising(&session("SOLO01"))
            .await
            .expect("advertise");
        let _first = radio
            .scan_and_connect(&session("SOLO01"), Duration::from_secs(1))
            .await
            .expect("first");
        let second = radio
            .scan_and_connect(&session("SOLO01"), Duration::from_secs(1))
            .await;
        assert!(matches!(second, Err(TransportError::ScanTimeout { .. })));
    }

    #[tokio::test]
    async fn duplicate_name_and_oversized_writes_are_rejected() {
        let radio = LoopbackRadio::new();
        let advertiser = radio
            .start_advertising(&session("DUP001"))
            .await
            .expect("advertise");
        assert!(matches!(
            radio.start_advertising(&session("DUP001")).await,
            Err(TransportError::AlreadyAdvertising(_))
        ));
        assert_eq!(
            advertiser.link.notify(Bytes::from_static(b"x")).await,
            Err(TransportError::NotConnected)
        );
        let central = radio
            .scan_and_connect(&session("DUP001"), Duration::from_secs(1))
            .await
            .expect("connect");
        let big = Bytes::from(vec![b'x'; MAX_WRITE_BYTES + 1]);
        assert!(matches!(
            central.link.write(big).await,
            Err(TransportError::PayloadTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn stop_disconnects_the_central() {
        let radio = LoopbackRadio::new();
        let advertiser = radio
            .start_advertising(&session("STOP01"))
            .await
            .expect("advertise");
        let mut central = radio
            .scan_and_connect(&session("STOP01"), Duration::from_secs(1))
            .await
            .expect("connect");
        advertiser.link.stop().await;
        assert_eq!(central.events.recv().await, Some(CentralEvent::Disconnected));
        assert!(radio.advertised_names().is_empty());
        assert_eq!(
            central.link.write(Bytes::from_static(b"late")).await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn duplicate_delivery_fault() {
        let radio = LoopbackRadio::new();
        radio.set_faults(LinkFaults {
            duplicate_delivery: true,
        });
        let mut advertiser = radio
            .start_advertising(&session("TWICE1"))
            .await
            .expect("advertise");
        let central = radio
            .scan_and_connect(&session("TWICE1"), Duration::from_secs(1))
            .await
            .expect("connect");
        let _ = advertiser.events.recv().await;
        central.link.write(Bytes::from_static(b"a")).await.expect("write");
        for _ in 0..2 {
            assert_eq!(
                advertiser.events.recv().await,
                Some(AdvertiserEvent::Write(Bytes::from_static(b"a")))
            );
        }
    }
}
