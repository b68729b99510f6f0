//! A single broadcast stream
//!
//! In direct-connect mode the stream is a pair of mailboxes: viewer signals
//! are queued for the capture endpoint and its replies are routed back by
//! viewer id. In relayed mode the stream terminates one session toward the
//! capture endpoint and one per viewer, and relays media between them.

use super::keepalive::Keepalive;
use super::signal_buffer::{DrainOrder, SignalBuffer};
use super::{ConnectionEvent, StreamError, StreamSettings};
use crate::rtc::{connect_to, RtcError, Session, SessionRegistry, Signal};
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

const DATA_CHANNEL_LABEL: &str = "data";

/// Viewers already wired to the current capture session
#[derive(Default)]
struct RelayWiring {
    capture: Weak<Session>,
    viewers: Vec<Weak<Session>>,
}

pub struct Stream {
    id: String,
    key: String,
    direct_connect: bool,
    private: bool,
    settings: StreamSettings,

    viewers: SessionRegistry,
    captures: SessionRegistry,
    capture: Mutex<Option<Arc<Session>>>,
    capture_connect: tokio::sync::Mutex<()>,
    wiring: Mutex<RelayWiring>,

    to_capture: SignalBuffer,
    to_viewers: SignalBuffer,

    snapshot: RwLock<Option<Bytes>>,
    keepalive: Keepalive,
    reported_viewers: AtomicUsize,
}

impl Stream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: &str,
        key: &str,
        direct_connect: bool,
        private: bool,
        settings: StreamSettings,
        viewers: SessionRegistry,
        to_viewers: SignalBuffer,
        captures: SessionRegistry,
    ) -> Arc<Self> {
        let keepalive = Keepalive::new(settings.keepalive);
        Arc::new(Self {
            id: id.to_string(),
            key: key.to_string(),
            direct_connect,
            private,
            settings,
            viewers,
            captures,
            capture: Mutex::new(None),
            capture_connect: tokio::sync::Mutex::new(()),
            wiring: Mutex::new(RelayWiring::default()),
            to_capture: SignalBuffer::new(DrainOrder::OffersFirst),
            to_viewers,
            snapshot: RwLock::new(None),
            keepalive,
            reported_viewers: AtomicUsize::new(0),
        })
    }

    /// Public stream id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stream id scoped to this process run
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_direct_connect(&self) -> bool {
        self.direct_connect
    }

    pub fn is_private(&self) -> bool {
        self.private
    }

    pub fn is_available(&self) -> bool {
        self.keepalive.is_available()
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.keepalive.uptime()
    }

    /// Record capture endpoint activity
    pub fn touch(&self) {
        self.keepalive.touch();
    }

    pub(crate) fn viewer_registry(&self) -> &SessionRegistry {
        &self.viewers
    }

    pub(crate) fn viewer_outbox(&self) -> &SignalBuffer {
        &self.to_viewers
    }

    pub fn viewer_count(&self) -> usize {
        if self.direct_connect {
            self.reported_viewers.load(Ordering::SeqCst)
        } else {
            self.viewers.len()
        }
    }

    pub fn set_snapshot(&self, jpeg: Bytes) {
        self.touch();
        *self.snapshot.write() = Some(jpeg);
    }

    pub fn snapshot(&self) -> Option<Bytes> {
        self.snapshot.read().clone()
    }

    pub fn record_connection_event(&self, event: &ConnectionEvent) {
        self.touch();
        self.reported_viewers.store(event.viewer_count, Ordering::SeqCst);
        info!(
            "Stream {} viewer {} {:?} ({} viewer(s))",
            self.id, event.viewer_id, event.kind, event.viewer_count
        );
    }

    /// Current capture session, if one is live
    pub fn capture_session(&self) -> Option<Arc<Session>> {
        self.capture.lock().clone()
    }

    /// Signals posted by a viewer
    pub async fn signal_from_viewer(self: &Arc<Self>, viewer_id: &str, signals: Vec<Signal>) -> Result<(), StreamError> {
        if self.direct_connect {
            self.to_capture
                .push_all(&self.key, signals.into_iter().map(|s| s.stamped(viewer_id)));
            return Ok(());
        }

        let viewer = self.viewer_session(viewer_id).await?;
        for signal in signals {
            if let Err(e) = viewer.apply(&signal).await {
                warn!(
                    "Stream {} viewer {} {} not applied: {}",
                    self.id,
                    viewer_id,
                    signal.kind.as_str(),
                    e
                );
            }
        }
        Ok(())
    }

    /// Signals posted by the capture endpoint
    pub async fn signal_from_capture(&self, signals: Vec<Signal>) {
        self.touch();

        if self.direct_connect {
            for signal in signals {
                if signal.viewer_id.is_empty() {
                    warn!("Stream {} dropped capture {} without viewer id", self.id, signal.kind.as_str());
                    continue;
                }
                let viewer_id = signal.viewer_id.clone();
                self.to_viewers.push(&viewer_id, signal);
            }
            return;
        }

        let Some(capture) = self.capture_session() else {
            warn!("Stream {} has no capture session; dropped {} signal(s)", self.id, signals.len());
            return;
        };
        for signal in signals {
            if let Err(e) = capture.apply(&signal).await {
                warn!("Stream {} capture {} not applied: {}", self.id, signal.kind.as_str(), e);
            }
        }
    }

    /// Long-poll for the capture endpoint
    pub async fn drain_for_capture(&self) -> Vec<Signal> {
        self.touch();
        self.to_capture.drain(&self.key, self.settings.capture_poll_timeout).await
    }

    /// Long-poll for a viewer
    pub async fn drain_for_viewer(&self, viewer_id: &str) -> Vec<Signal> {
        self.to_viewers.drain(viewer_id, self.settings.viewer_poll_timeout).await
    }

    pub fn pending_for_capture(&self) -> usize {
        self.to_capture.pending(&self.key)
    }

    /// Session for `viewer_id`, creating and wiring it on first use.
    ///
    /// Also reopens the capture connection when none is live.
    pub async fn viewer_session(self: &Arc<Self>, viewer_id: &str) -> Result<Arc<Session>, StreamError> {
        let (viewer, created) = self.viewers.get_or_create(viewer_id).await?;
        if created {
            let outbox = self.to_viewers.clone();
            let recipient = viewer_id.to_string();
            viewer.on_signal(move |signal| outbox.push(&recipient, signal.clone().stamped(&recipient)));

            let outbox = self.to_viewers.clone();
            let recipient = viewer_id.to_string();
            viewer.on_disconnected(move |_| outbox.remove(&recipient));
        } else if self.capture_session().is_some_and(|c| !c.is_terminal()) {
            return Ok(viewer);
        }

        // New viewer, or a kept viewer whose capture session is gone after a
        // restart or upstream loss
        match self.connect_capture_endpoint().await {
            Ok(capture) => {
                self.wire_viewer(&capture, &viewer).await;
                Ok(viewer)
            }
            Err(e) => {
                if created {
                    self.viewers.remove(viewer_id).await;
                }
                Err(e)
            }
        }
    }

    /// Return the live capture session, or start negotiating a new one.
    ///
    /// A new session gets receive-only video and audio transceivers and the
    /// control data channel, is wired to every registered viewer, and sends
    /// its offer to the capture mailbox.
    pub async fn connect_capture_endpoint(self: &Arc<Self>) -> Result<Arc<Session>, StreamError> {
        let _guard = self.capture_connect.lock().await;

        if let Some(session) = self.capture_session() {
            if !session.is_terminal() {
                return Ok(session);
            }
        }

        let (session, created) = self.captures.get_or_create(&self.key).await?;
        if !created {
            *self.capture.lock() = Some(session.clone());
            return Ok(session);
        }

        if let Err(e) = self.negotiate_capture(&session).await {
            warn!("Stream {} capture setup failed: {}", self.id, e);
            self.captures.remove(&self.key).await;
            self.clear_capture_if(&session);
            return Err(e.into());
        }

        info!("Stream {} connecting to capture endpoint", self.id);
        Ok(session)
    }

    async fn negotiate_capture(self: &Arc<Self>, session: &Arc<Session>) -> Result<(), RtcError> {
        let outbox = self.to_capture.clone();
        let key = self.key.clone();
        session.on_signal(move |signal| outbox.push(&key, signal.clone()));

        session.add_recvonly_transceiver(RTPCodecType::Video).await?;
        session.add_recvonly_transceiver(RTPCodecType::Audio).await?;
        session.create_data_channel(DATA_CHANNEL_LABEL).await?;

        self.arm_watchdog(session);
        *self.capture.lock() = Some(session.clone());

        // Viewers kept across a restart follow the new capture session
        for viewer in self.viewers.sessions() {
            if !viewer.is_terminal() {
                self.wire_viewer(session, &viewer).await;
            }
        }

        session.initiate().await?;
        Ok(())
    }

    async fn wire_viewer(&self, capture: &Arc<Session>, viewer: &Arc<Session>) {
        let fresh = {
            let mut wiring = self.wiring.lock();
            let current = Arc::downgrade(capture);
            if !wiring.capture.ptr_eq(&current) {
                *wiring = RelayWiring {
                    capture: current,
                    viewers: Vec::new(),
                };
            }
            wiring.viewers.retain(|v| v.strong_count() > 0);
            let target = Arc::downgrade(viewer);
            if wiring.viewers.iter().any(|v| v.ptr_eq(&target)) {
                false
            } else {
                wiring.viewers.push(target);
                true
            }
        };

        if fresh {
            connect_to(capture, viewer, self.settings.expected_tracks).await;
        }
    }

    fn arm_watchdog(self: &Arc<Self>, session: &Arc<Session>) {
        let stream = Arc::downgrade(self);
        let watched = Arc::downgrade(session);
        session.on_disconnected(move |_| {
            if let (Some(stream), Some(session)) = (stream.upgrade(), watched.upgrade()) {
                if stream.clear_capture_if(&session) {
                    debug!("Stream {} capture session cleared", stream.id);
                }
            }
        });
    }

    /// Clear the cached capture session only if it is still `session`
    pub(crate) fn clear_capture_if(&self, session: &Arc<Session>) -> bool {
        let mut current = self.capture.lock();
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, session)) {
            *current = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn detach_capture(&self) {
        self.capture.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::test_support::{factory, session};
    use crate::rtc::SignalKind;
    use std::time::Duration;
    use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

    fn settings() -> StreamSettings {
        StreamSettings {
            viewer_poll_timeout: Duration::from_millis(50),
            capture_poll_timeout: Duration::from_millis(50),
            ..StreamSettings::default()
        }
    }

    fn registry(name: &str) -> SessionRegistry {
        SessionRegistry::new(name, factory(), Duration::from_secs(2), Duration::from_secs(5))
    }

    fn stream(direct: bool) -> Arc<Stream> {
        Stream::new(
            "desk",
            "desk:run",
            direct,
            false,
            settings(),
            registry("viewers"),
            SignalBuffer::new(DrainOrder::Arrival),
            registry("captures"),
        )
    }

    #[tokio::test]
    async fn test_direct_connect_routes_by_viewer() {
        let stream = stream(true);
        stream
            .signal_from_viewer("VIEWER1", vec![Signal::offer("spoofed", "v=0")])
            .await
            .unwrap();

        let for_capture = stream.drain_for_capture().await;
        assert_eq!(for_capture.len(), 1);
        assert_eq!(for_capture[0].viewer_id, "VIEWER1");
        assert!(stream.viewer_registry().is_empty());

        stream
            .signal_from_capture(vec![Signal::answer("VIEWER1", "v=0"), Signal::answer("", "lost")])
            .await;
        let for_viewer = stream.drain_for_viewer("VIEWER1").await;
        assert_eq!(for_viewer.len(), 1);
        assert_eq!(for_viewer[0].kind, SignalKind::Answer);
        assert!(stream.drain_for_viewer("VIEWER2").await.is_empty());
    }

    #[tokio::test]
    async fn test_capture_activity_keeps_stream_available() {
        let stream = stream(true);
        assert!(!stream.is_available());
        stream.set_snapshot(Bytes::from_static(b"\xff\xd8"));
        assert!(stream.is_available());
        assert_eq!(stream.snapshot().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_direct_viewer_count_from_reports() {
        let stream = stream(true);
        stream.record_connection_event(&ConnectionEvent {
            kind: crate::stream::ConnectionEventKind::ViewerConnected,
            viewer_id: "A".to_string(),
            viewer_count: 4,
        });
        assert_eq!(stream.viewer_count(), 4);
    }

    #[tokio::test]
    async fn test_connect_capture_queues_offer_and_reuses_session() {
        let stream = stream(false);
        let first = stream.connect_capture_endpoint().await.unwrap();
        let second = stream.connect_capture_endpoint().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let for_capture = stream.drain_for_capture().await;
        assert_eq!(for_capture.first().map(|s| s.kind), Some(SignalKind::Offer));
        assert!(for_capture.first().unwrap().sdp.contains("m=video"));
        assert!(for_capture.first().unwrap().sdp.contains("m=audio"));

        first.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_watchdog_clears_only_current_capture() {
        let stream = stream(false);
        let capture = stream.connect_capture_endpoint().await.unwrap();
        let stranger = session("other").await;

        assert!(!stream.clear_capture_if(&stranger));
        assert!(stream.capture_session().is_some());

        capture.close().await.unwrap();
        assert!(stream.capture_session().is_none());
        stranger.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_relayed_viewer_offer_is_answered() {
        let stream = stream(false);
        let browser = session("browser").await;
        browser.add_recvonly_transceiver(RTPCodecType::Video).await.unwrap();
        let offer = browser.initiate().await.unwrap();

        stream
            .signal_from_viewer("VIEWER1", vec![Signal::offer("", offer.sdp)])
            .await
            .unwrap();

        let replies = stream.drain_for_viewer("VIEWER1").await;
        assert_eq!(replies.first().map(|s| s.kind), Some(SignalKind::Answer));
        assert!(replies.iter().all(|s| s.viewer_id == "VIEWER1"));
        assert!(stream.capture_session().is_some());
        assert_eq!(stream.viewer_count(), 1);

        browser.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_kept_viewer_reconnects_lost_capture() {
        let stream = stream(false);
        let browser = session("browser").await;
        browser.add_recvonly_transceiver(RTPCodecType::Video).await.unwrap();
        let offer = browser.initiate().await.unwrap();
        stream
            .signal_from_viewer("VIEWER1", vec![Signal::offer("", offer.sdp)])
            .await
            .unwrap();

        let first = stream.capture_session().unwrap();
        assert_eq!(stream.drain_for_capture().await.first().map(|s| s.kind), Some(SignalKind::Offer));
        first.close().await.unwrap();
        assert!(stream.capture_session().is_none());

        let candidate = RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 2130706431 192.0.2.1 5000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        stream
            .signal_from_viewer("VIEWER1", vec![Signal::candidate("", candidate)])
            .await
            .unwrap();

        let second = stream.capture_session().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(stream.drain_for_capture().await.first().map(|s| s.kind), Some(SignalKind::Offer));
        assert_eq!(stream.viewer_count(), 1);

        browser.close().await.unwrap();
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_viewer_mailbox_dropped_on_disconnect() {
        let stream = stream(false);
        let browser = session("browser").await;
        browser.add_recvonly_transceiver(RTPCodecType::Audio).await.unwrap();
        let offer = browser.initiate().await.unwrap();
        stream
            .signal_from_viewer("VIEWER1", vec![Signal::offer("", offer.sdp)])
            .await
            .unwrap();
        assert!(stream.viewer_outbox().pending("VIEWER1") > 0);

        stream.viewer_registry().remove("VIEWER1").await;
        assert_eq!(stream.viewer_outbox().pending("VIEWER1"), 0);
        assert!(stream.viewer_outbox().is_empty());

        browser.close().await.unwrap();
    }
}
