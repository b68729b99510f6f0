//! Media and control relay
//!
//! A producer session's remote tracks are read once and fanned out over a
//! broadcast channel; each consumer gets its own local track and forward
//! loop, so a failing consumer never stalls the others. Data channel
//! messages are copied verbatim in both directions.

use super::session::{Session, SessionState};
use super::RtcError;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

/// Packets buffered per consumer before it starts lagging
const RELAY_CHANNEL_CAPACITY: usize = 1024;

const RELAY_STREAM_ID: &str = "relay";

/// Where relayed packets come from
#[async_trait]
pub trait RtpSource: Send + Sync {
    async fn read_packet(&self) -> Result<Packet, RtcError>;
}

/// Where relayed packets go
#[async_trait]
pub trait RtpSink: Send + Sync {
    async fn write_packet(&self, packet: &Packet) -> Result<(), RtcError>;
}

#[async_trait]
impl RtpSource for TrackRemote {
    async fn read_packet(&self) -> Result<Packet, RtcError> {
        self.read_rtp()
            .await
            .map(|(packet, _)| packet)
            .map_err(|e| RtcError::Media(format!("RTP read failed: {}", e)))
    }
}

#[async_trait]
impl RtpSink for TrackLocalStaticRTP {
    async fn write_packet(&self, packet: &Packet) -> Result<(), RtcError> {
        self.write_rtp(packet)
            .await
            .map(|_| ())
            .map_err(|e| RtcError::Media(format!("RTP write failed: {}", e)))
    }
}

/// A remote track republished for any number of consumers
pub struct RelayTrack {
    id: String,
    kind: RTPCodecType,
    ssrc: u32,
    capability: RTCRtpCodecCapability,
    packets: Mutex<Option<broadcast::Sender<Packet>>>,
}

impl RelayTrack {
    /// Start relaying `remote`.
    ///
    /// The pump task ends quietly when the remote track stops producing. For
    /// video tracks a keyframe request goes to `producer` every
    /// `keyframe_interval` while at least one consumer is subscribed.
    pub fn spawn(remote: Arc<TrackRemote>, producer: Weak<Session>, keyframe_interval: Duration) -> Arc<Self> {
        let track = Self::new(
            remote.id(),
            remote.kind(),
            remote.ssrc(),
            remote.codec().capability,
        );

        if let Some(tx) = track.sender() {
            let relay = track.clone();
            tokio::spawn(async move {
                pump_packets(remote.as_ref(), &tx, &relay.id).await;
                relay.finish();
            });
        }

        if track.kind == RTPCodecType::Video {
            let relay = track.clone();
            tokio::spawn(async move {
                request_keyframes(relay, producer, keyframe_interval).await;
            });
        }

        track
    }

    pub fn new(id: impl Into<String>, kind: RTPCodecType, ssrc: u32, capability: RTCRtpCodecCapability) -> Arc<Self> {
        let (tx, _) = broadcast::channel(RELAY_CHANNEL_CAPACITY);
        Arc::new(Self {
            id: id.into(),
            kind,
            ssrc,
            capability,
            packets: Mutex::new(Some(tx)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> RTPCodecType {
        self.kind
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn capability(&self) -> &RTCRtpCodecCapability {
        &self.capability
    }

    /// Receive every packet from now on; `None` once the source has ended
    pub fn subscribe(&self) -> Option<broadcast::Receiver<Packet>> {
        self.packets.lock().as_ref().map(|tx| tx.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.packets.lock().as_ref().map_or(0, |tx| tx.receiver_count())
    }

    pub fn is_ended(&self) -> bool {
        self.packets.lock().is_none()
    }

    fn sender(&self) -> Option<broadcast::Sender<Packet>> {
        self.packets.lock().clone()
    }

    /// Drop the publishing side; consumers see the channel close once the
    /// pump's own handle is gone too.
    pub(crate) fn finish(&self) {
        if self.packets.lock().take().is_some() {
            debug!("Relay track {} ended", self.id);
        }
    }
}

/// Copy packets from `source` into `tx` until the source fails
pub async fn pump_packets<S: RtpSource + ?Sized>(source: &S, tx: &broadcast::Sender<Packet>, label: &str) {
    loop {
        match source.read_packet().await {
            // No receivers is fine; packets before the first consumer are dropped
            Ok(packet) => {
                let _ = tx.send(packet);
            }
            Err(e) => {
                debug!("Relay track {} source stopped: {}", label, e);
                break;
            }
        }
    }
}

/// Copy packets from `rx` into `sink` until the sink fails, the channel
/// closes or `alive` reports the consumer gone.
pub async fn forward_packets<S, F>(mut rx: broadcast::Receiver<Packet>, sink: &S, label: &str, alive: F)
where
    S: RtpSink + ?Sized,
    F: Fn() -> bool,
{
    loop {
        match rx.recv().await {
            Ok(packet) => {
                if !alive() {
                    debug!("{} consumer gone", label);
                    break;
                }
                if let Err(e) = sink.write_packet(&packet).await {
                    warn!("{} write error: {}", label, e);
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("{} subscriber lagged, skipped {} packets", label, n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("{} producer closed channel", label);
                break;
            }
        }
    }
}

async fn request_keyframes(track: Arc<RelayTrack>, producer: Weak<Session>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        if track.is_ended() {
            break;
        }
        let Some(session) = producer.upgrade() else {
            break;
        };
        if session.is_terminal() || session.peer_connection().connection_state() == RTCPeerConnectionState::Closed {
            break;
        }
        if track.subscriber_count() == 0 {
            continue;
        }
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: track.ssrc,
        };
        if let Err(e) = session.peer_connection().write_rtcp(&[Box::new(pli)]).await {
            warn!("Session {} PLI send error: {}", session.id(), e);
            break;
        }
    }
}

/// Publish `track` on `consumer` and start its forward loop.
///
/// When the producer track ends (or the consumer write fails) the sender is
/// removed from the consumer again.
pub async fn attach_track(track: &Arc<RelayTrack>, consumer: &Arc<Session>) -> Result<(), RtcError> {
    let rx = track
        .subscribe()
        .ok_or_else(|| RtcError::Media(format!("Relay track {} has ended", track.id)))?;

    let local = Arc::new(TrackLocalStaticRTP::new(
        track.capability.clone(),
        track.id.clone(),
        RELAY_STREAM_ID.to_string(),
    ));
    let sender = consumer.add_track(local.clone()).await?;

    // Drain RTCP so interceptors keep processing receiver reports
    let rtcp_sender = sender.clone();
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while rtcp_sender.read(&mut rtcp_buf).await.is_ok() {}
    });

    let label = format!("Relay {} -> {}", track.id, consumer.id());
    let weak = Arc::downgrade(consumer);
    tokio::spawn(async move {
        let alive = || weak.upgrade().is_some_and(|s| !s.is_terminal());
        forward_packets(rx, local.as_ref(), &label, alive).await;

        if let Some(consumer) = weak.upgrade() {
            if !consumer.is_terminal() {
                if let Err(e) = consumer.remove_sender(&sender).await {
                    debug!("{}: {}", label, e);
                }
            }
        }
    });

    info!("Session {} attached relay track {} ({})", consumer.id(), track.id, track.kind);
    Ok(())
}

/// Forward data channel messages from `from` to `to`, preserving order
fn bridge_data(from: &Arc<Session>, to: &Arc<Session>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    from.on_data_while(move |data| tx.send(data.clone()).is_ok());

    let weak = Arc::downgrade(to);
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            let Some(to) = weak.upgrade() else {
                break;
            };
            if to.is_terminal() {
                break;
            }
            if let Err(e) = to.send_data(&data).await {
                debug!("Dropped data message for session {}: {}", to.id(), e);
            }
        }
    });
}

/// Ask `consumer` for a fresh offer round once it can take one
fn renegotiate(consumer: &Arc<Session>) {
    // The consumer's first offer/answer will carry the tracks
    if !consumer.has_remote_description() {
        return;
    }

    let fired = Arc::new(AtomicBool::new(false));
    let start = {
        let fired = fired.clone();
        let weak = Arc::downgrade(consumer);
        move || {
            if fired.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(consumer) = weak.upgrade() {
                tokio::spawn(async move {
                    info!("Session {} renegotiating for relay tracks", consumer.id());
                    if let Err(e) = consumer.initiate().await {
                        warn!("Session {} renegotiation failed: {}", consumer.id(), e);
                    }
                });
            }
        }
    };

    let on_connected = start.clone();
    consumer.on_connected_while(move |_| {
        on_connected();
        false
    });
    if consumer.state() == SessionState::Connected {
        start();
    }
}

/// Attachment bookkeeping for one producer/consumer pair
#[derive(Default)]
struct AttachProgress {
    claimed: HashSet<String>,
    completed: usize,
}

impl AttachProgress {
    /// Reserve `track_id`; `false` when it is already attached or attaching
    fn claim(&mut self, track_id: &str) -> bool {
        self.claimed.insert(track_id.to_string())
    }

    fn release(&mut self, track_id: &str) {
        self.claimed.remove(track_id);
    }

    /// Record a finished attachment; `true` when it was the last expected one
    fn complete(&mut self, expected: usize) -> bool {
        self.completed += 1;
        self.completed == expected
    }
}

struct Wiring {
    producer: Weak<Session>,
    consumer: Weak<Session>,
    expected_tracks: usize,
    progress: Mutex<AttachProgress>,
}

impl Wiring {
    /// Attach `track` unless already attached; renegotiate once every
    /// expected track has actually been added to the consumer.
    async fn attach(&self, track: &Arc<RelayTrack>, renegotiate_when_complete: bool) {
        let Some(consumer) = self.consumer.upgrade() else {
            return;
        };
        if !self.progress.lock().claim(&track.id) {
            return;
        }

        if let Err(e) = attach_track(track, &consumer).await {
            warn!("Session {} failed to attach relay track {}: {}", consumer.id(), track.id, e);
            self.progress.lock().release(&track.id);
            return;
        }

        let complete = self.progress.lock().complete(self.expected_tracks);
        if renegotiate_when_complete && complete {
            renegotiate(&consumer);
        }
    }

    fn is_live(&self) -> bool {
        let producer_live = self.producer.upgrade().is_some_and(|s| !s.is_terminal());
        let consumer_live = self.consumer.upgrade().is_some_and(|s| !s.is_terminal());
        producer_live && consumer_live
    }
}

/// Relay `producer`'s media and data to `consumer`.
///
/// Tracks the producer already holds are attached before this returns, so a
/// consumer that has not negotiated yet gets them in its first answer.
/// Tracks that arrive later are attached as they come; once the expected
/// number is attached the consumer is renegotiated.
pub async fn connect_to(producer: &Arc<Session>, consumer: &Arc<Session>, expected_tracks: usize) {
    bridge_data(producer, consumer);
    bridge_data(consumer, producer);

    let wiring = Arc::new(Wiring {
        producer: Arc::downgrade(producer),
        consumer: Arc::downgrade(consumer),
        expected_tracks,
        progress: Mutex::new(AttachProgress::default()),
    });

    let deferred = wiring.clone();
    producer.on_track_while(move |track| {
        if !deferred.is_live() {
            return false;
        }
        let wiring = deferred.clone();
        let track = track.clone();
        tokio::spawn(async move {
            wiring.attach(&track, true).await;
        });
        true
    });

    let existing = producer.local_tracks();
    let complete = producer.state() == SessionState::Connected && existing.len() >= expected_tracks;
    for track in &existing {
        wiring.attach(track, !complete).await;
    }

    debug!(
        "Session {} wired to producer {} ({} of {} tracks present)",
        consumer.id(),
        producer.id(),
        existing.len(),
        expected_tracks
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn packet(seq: u16) -> Packet {
        let mut packet = Packet::default();
        packet.header.sequence_number = seq;
        packet.payload = Bytes::from(vec![seq as u8; 4]);
        packet
    }

    struct ScriptedSource {
        packets: Mutex<Vec<Packet>>,
    }

    #[async_trait]
    impl RtpSource for ScriptedSource {
        async fn read_packet(&self) -> Result<Packet, RtcError> {
            let mut packets = self.packets.lock();
            if packets.is_empty() {
                return Err(RtcError::Media("EOF".to_string()));
            }
            Ok(packets.remove(0))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<u16>>,
        fail_after: Option<usize>,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl RtpSink for RecordingSink {
        async fn write_packet(&self, packet: &Packet) -> Result<(), RtcError> {
            let n = self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_after.is_some_and(|limit| n >= limit) {
                return Err(RtcError::Media("broken pipe".to_string()));
            }
            self.seen.lock().push(packet.header.sequence_number);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_write_failure_isolated_to_one_consumer() {
        let (tx, _) = broadcast::channel(64);
        let healthy = Arc::new(RecordingSink::default());
        let broken = Arc::new(RecordingSink {
            fail_after: Some(2),
            ..Default::default()
        });

        let rx_healthy = tx.subscribe();
        let rx_broken = tx.subscribe();
        let h = healthy.clone();
        let healthy_loop = tokio::spawn(async move {
            forward_packets(rx_healthy, h.as_ref(), "healthy", || true).await;
        });
        let b = broken.clone();
        let broken_loop = tokio::spawn(async move {
            forward_packets(rx_broken, b.as_ref(), "broken", || true).await;
        });

        let source = ScriptedSource {
            packets: Mutex::new((0..10).map(packet).collect()),
        };
        pump_packets(&source, &tx, "video").await;
        drop(tx);

        healthy_loop.await.unwrap();
        broken_loop.await.unwrap();

        assert_eq!(*healthy.seen.lock(), (0..10).collect::<Vec<u16>>());
        assert_eq!(*broken.seen.lock(), vec![0, 1]);
        assert_eq!(broken.writes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_forward_stops_when_consumer_gone() {
        let (tx, rx) = broadcast::channel(8);
        let sink = RecordingSink::default();
        tx.send(packet(1)).unwrap();
        tx.send(packet(2)).unwrap();
        forward_packets(rx, &sink, "gone", || false).await;
        assert!(sink.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_finished_track_refuses_subscribers() {
        let track = RelayTrack::new("video", RTPCodecType::Video, 1234, RTCRtpCodecCapability::default());
        let rx = track.subscribe();
        assert!(rx.is_some());
        assert_eq!(track.subscriber_count(), 1);

        track.finish();
        assert!(track.is_ended());
        assert!(track.subscribe().is_none());

        let mut rx = rx.unwrap();
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));
    }

    #[tokio::test]
    async fn test_attach_adds_sender_to_consumer() {
        let consumer = crate::rtc::test_support::session("viewer").await;
        let track = RelayTrack::new(
            "video",
            RTPCodecType::Video,
            1234,
            RTCRtpCodecCapability {
                mime_type: webrtc::api::media_engine::MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        );

        attach_track(&track, &consumer).await.unwrap();
        assert_eq!(consumer.peer_connection().get_senders().await.len(), 1);
        assert_eq!(track.subscriber_count(), 1);

        consumer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_to_without_tracks_attaches_nothing() {
        let producer = crate::rtc::test_support::session("capture").await;
        let consumer = crate::rtc::test_support::session("viewer").await;

        connect_to(&producer, &consumer, 2).await;
        connect_to(&producer, &consumer, 2).await;
        // No producer tracks yet, nothing attached
        assert!(consumer.peer_connection().get_senders().await.is_empty());

        producer.close().await.unwrap();
        consumer.close().await.unwrap();
    }

    #[test]
    fn test_renegotiation_waits_for_slowest_attachment() {
        let mut progress = AttachProgress::default();
        assert!(progress.claim("video"));
        assert!(progress.claim("audio"));
        assert!(!progress.claim("video"));

        // Audio finishes first; the offer must wait for video
        assert!(!progress.complete(2));
        assert!(progress.complete(2));
    }

    #[test]
    fn test_failed_attachment_can_be_retried() {
        let mut progress = AttachProgress::default();
        assert!(progress.claim("video"));
        progress.release("video");
        assert!(progress.claim("video"));
        assert!(progress.complete(1));
    }
}
