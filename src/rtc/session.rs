//! WebRTC Session
//!
//! One negotiated connection to a remote endpoint (capture endpoint or
//! viewer). The session owns the peer connection and enforces negotiation
//! sequencing:
//! - remote candidates are rejected until a remote description is applied
//! - local candidates are held back until the remote description is applied,
//!   then emitted in gathering order
//! - remote tracks are republished as `RelayTrack`s
//!
//! Outbound signals and lifecycle changes are surfaced through typed
//! listeners. Signal handlers run inline on the emitting task and must not
//! block.

use super::events::Listeners;
use super::relay::RelayTrack;
use super::signal::{Signal, SignalKind};
use super::RtcError;
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, nothing exchanged yet
    New,
    /// Offer/answer in progress or ICE connecting
    Negotiating,
    /// Media and data flowing
    Connected,
    /// Terminal; the peer connection is closed
    Disconnected,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Disconnected)
    }
}

impl From<RTCPeerConnectionState> for SessionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => SessionState::Negotiating,
            RTCPeerConnectionState::Connected => SessionState::Connected,
            RTCPeerConnectionState::Disconnected
            | RTCPeerConnectionState::Failed
            | RTCPeerConnectionState::Closed => SessionState::Disconnected,
            _ => SessionState::New,
        }
    }
}

struct Negotiation {
    state: SessionState,
    remote_applied: bool,
    pending_candidates: Vec<RTCIceCandidateInit>,
}

/// A single negotiated connection
pub struct Session {
    id: String,
    peer_connection: Arc<RTCPeerConnection>,
    negotiation: Mutex<Negotiation>,
    local_tracks: RwLock<Vec<Arc<RelayTrack>>>,
    data_channel: RwLock<Option<Arc<RTCDataChannel>>>,
    keyframe_interval: Duration,

    signals: Listeners<Signal>,
    connected: Listeners<()>,
    disconnected: Listeners<()>,
    tracks: Listeners<Arc<RelayTrack>>,
    data: Listeners<Bytes>,
}

impl Session {
    /// Wrap a peer connection and hook its callbacks.
    ///
    /// `keyframe_interval` paces the keyframe requests sent upstream for
    /// tracks this session receives.
    pub fn new(
        id: impl Into<String>,
        peer_connection: Arc<RTCPeerConnection>,
        keyframe_interval: Duration,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            id: id.into(),
            peer_connection,
            negotiation: Mutex::new(Negotiation {
                state: SessionState::New,
                remote_applied: false,
                pending_candidates: Vec::new(),
            }),
            local_tracks: RwLock::new(Vec::new()),
            data_channel: RwLock::new(None),
            keyframe_interval,
            signals: Listeners::new(),
            connected: Listeners::new(),
            disconnected: Listeners::new(),
            tracks: Listeners::new(),
            data: Listeners::new(),
        });
        session.install_callbacks();
        session
    }

    fn install_callbacks(self: &Arc<Self>) {
        let pc = &self.peer_connection;

        let weak = Arc::downgrade(self);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let weak = weak.clone();
            Box::pin(async move {
                let (Some(session), Some(candidate)) = (weak.upgrade(), candidate) else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => session.on_local_candidate(init),
                    Err(e) => warn!("Session {} failed to serialize local candidate: {}", session.id, e),
                }
            })
        }));

        let weak = Arc::downgrade(self);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(session) = weak.upgrade() {
                    session.handle_state_change(state);
                }
            })
        }));

        let weak = Arc::downgrade(self);
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(session) = weak.upgrade() {
                        session.handle_remote_track(track);
                    }
                })
            },
        ));

        let weak = Arc::downgrade(self);
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(session) = weak.upgrade() {
                    info!("Session {} received data channel '{}'", session.id, channel.label());
                    session.attach_data_channel(channel);
                }
            })
        }));
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }

    pub fn state(&self) -> SessionState {
        self.negotiation.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether a remote description has been applied at least once
    pub fn has_remote_description(&self) -> bool {
        self.negotiation.lock().remote_applied
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.negotiation.lock().pending_candidates.len()
    }

    /// Tracks received from the remote side, ready to be republished
    pub fn local_tracks(&self) -> Vec<Arc<RelayTrack>> {
        self.local_tracks.read().clone()
    }

    /// Outbound signals (answers, offers, local candidates)
    pub fn on_signal(&self, handler: impl Fn(&Signal) + Send + Sync + 'static) {
        self.signals.subscribe(handler);
    }

    pub fn on_connected(&self, handler: impl Fn(&()) + Send + Sync + 'static) {
        self.connected.subscribe(handler);
    }

    pub fn on_connected_while(&self, handler: impl Fn(&()) -> bool + Send + Sync + 'static) {
        self.connected.subscribe_while(handler);
    }

    pub fn on_disconnected(&self, handler: impl Fn(&()) + Send + Sync + 'static) {
        self.disconnected.subscribe(handler);
    }

    pub fn on_track_while(&self, handler: impl Fn(&Arc<RelayTrack>) -> bool + Send + Sync + 'static) {
        self.tracks.subscribe_while(handler);
    }

    pub fn on_data_while(&self, handler: impl Fn(&Bytes) -> bool + Send + Sync + 'static) {
        self.data.subscribe_while(handler);
    }

    /// Dispatch an inbound signal to the matching negotiation step
    pub async fn apply(&self, signal: &Signal) -> Result<(), RtcError> {
        match signal.kind {
            SignalKind::Offer => self.apply_offer(&signal.sdp).await.map(|_| ()),
            SignalKind::Answer => self.apply_answer(&signal.sdp).await,
            SignalKind::Candidate => match signal.candidate.clone() {
                Some(candidate) => self.apply_candidate(candidate).await,
                None => Err(RtcError::Ice(format!("Session {} received an empty candidate", self.id))),
            },
        }
    }

    /// Apply a remote offer and answer it.
    ///
    /// The answer is emitted to signal listeners, followed by any local
    /// candidates gathered meanwhile, and also returned to the caller.
    pub async fn apply_offer(&self, sdp: &str) -> Result<Signal, RtcError> {
        self.begin_negotiation()?;

        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| RtcError::Sdp(format!("Invalid SDP offer: {}", e)))?;

        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| RtcError::Sdp(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| RtcError::Sdp(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| RtcError::Sdp(format!("Failed to set local description: {}", e)))?;

        let signal = Signal::answer(self.id.clone(), answer.sdp);
        self.mark_remote_applied(Some(&signal));
        debug!("Session {} answered remote offer", self.id);
        Ok(signal)
    }

    /// Apply a remote answer, then flush held-back local candidates
    pub async fn apply_answer(&self, sdp: &str) -> Result<(), RtcError> {
        self.begin_negotiation()?;

        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| RtcError::Sdp(format!("Invalid SDP answer: {}", e)))?;

        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| RtcError::Sdp(format!("Failed to set remote description: {}", e)))?;

        let flushed = self.mark_remote_applied(None);
        debug!("Session {} applied remote answer, flushed {} candidate(s)", self.id, flushed);
        Ok(())
    }

    /// Add a remote ICE candidate
    pub async fn apply_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), RtcError> {
        {
            let negotiation = self.negotiation.lock();
            if negotiation.state.is_terminal() {
                return Err(RtcError::SessionClosed(self.id.clone()));
            }
            if !negotiation.remote_applied {
                warn!("Session {} dropped remote candidate received before offer", self.id);
                return Err(RtcError::CandidateBeforeOffer(self.id.clone()));
            }
        }

        self.peer_connection
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| RtcError::Ice(format!("Failed to add ICE candidate: {}", e)))
    }

    /// Handle a locally gathered candidate
    pub fn on_local_candidate(&self, candidate: RTCIceCandidateInit) {
        let mut negotiation = self.negotiation.lock();
        if negotiation.state.is_terminal() {
            return;
        }
        if !negotiation.remote_applied {
            negotiation.pending_candidates.push(candidate);
            return;
        }
        // Emitted under the lock so it cannot overtake a concurrent flush
        self.signals.emit(&Signal::candidate(self.id.clone(), candidate));
    }

    /// Create and emit a local offer.
    ///
    /// Used toward the capture endpoint and to renegotiate with a viewer
    /// after relay tracks were added.
    pub async fn initiate(&self) -> Result<Signal, RtcError> {
        self.begin_negotiation()?;

        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| RtcError::Sdp(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| RtcError::Sdp(format!("Failed to set local description: {}", e)))?;

        let signal = Signal::offer(self.id.clone(), offer.sdp);
        self.signals.emit(&signal);
        info!("Session {} sent offer", self.id);
        Ok(signal)
    }

    /// Add a receive-only transceiver for `kind`
    pub async fn add_recvonly_transceiver(&self, kind: RTPCodecType) -> Result<(), RtcError> {
        self.peer_connection
            .add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map(|_| ())
            .map_err(|e| RtcError::Media(format!("Failed to add {} transceiver: {}", kind, e)))
    }

    /// Open a locally initiated data channel
    pub async fn create_data_channel(self: &Arc<Self>, label: &str) -> Result<Arc<RTCDataChannel>, RtcError> {
        let channel = self
            .peer_connection
            .create_data_channel(label, None)
            .await
            .map_err(|e| RtcError::DataChannel(format!("Failed to create data channel: {}", e)))?;
        self.attach_data_channel(channel.clone());
        Ok(channel)
    }

    /// Send bytes on the data channel if it is open
    pub async fn send_data(&self, data: &Bytes) -> Result<(), RtcError> {
        let channel = self.data_channel.read().clone();
        let Some(channel) = channel else {
            return Err(RtcError::DataChannel(format!("Session {} has no data channel", self.id)));
        };
        if channel.ready_state() != RTCDataChannelState::Open {
            return Err(RtcError::DataChannel(format!("Session {} data channel is not open", self.id)));
        }
        channel
            .send(data)
            .await
            .map(|_| ())
            .map_err(|e| RtcError::DataChannel(format!("Failed to send: {}", e)))
    }

    /// Publish a local track on this connection
    pub async fn add_track(&self, track: Arc<TrackLocalStaticRTP>) -> Result<Arc<RTCRtpSender>, RtcError> {
        self.peer_connection
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| RtcError::Media(format!("Failed to add track: {}", e)))
    }

    pub async fn remove_sender(&self, sender: &Arc<RTCRtpSender>) -> Result<(), RtcError> {
        self.peer_connection
            .remove_track(sender)
            .await
            .map_err(|e| RtcError::Media(format!("Failed to remove track: {}", e)))
    }

    /// Close the session; emits the disconnected event on first call
    pub async fn close(&self) -> Result<(), RtcError> {
        self.mark_terminal();
        self.peer_connection
            .close()
            .await
            .map_err(|e| RtcError::ConnectionFailed(format!("Failed to close connection: {}", e)))
    }

    /// Re-read the primitive's connection state.
    ///
    /// Catches terminal transitions whose callback never arrived. Returns
    /// whether the session is terminal afterwards.
    pub fn sync_with_connection(&self) -> bool {
        let state = self.peer_connection.connection_state();
        if matches!(state, RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed) {
            self.mark_terminal();
        }
        self.is_terminal()
    }

    pub(crate) fn handle_state_change(&self, state: RTCPeerConnectionState) {
        info!("Session {} peer connection state: {}", self.id, state);
        match SessionState::from(state) {
            SessionState::Connected => {
                {
                    let mut negotiation = self.negotiation.lock();
                    if negotiation.state.is_terminal() || negotiation.state == SessionState::Connected {
                        return;
                    }
                    negotiation.state = SessionState::Connected;
                }
                self.connected.emit(&());
            }
            SessionState::Disconnected => {
                if self.mark_terminal() {
                    let pc = self.peer_connection.clone();
                    tokio::spawn(async move {
                        let _ = pc.close().await;
                    });
                }
            }
            _ => {}
        }
    }

    /// Enter the terminal state; returns `true` for the first caller only
    pub(crate) fn mark_terminal(&self) -> bool {
        {
            let mut negotiation = self.negotiation.lock();
            if negotiation.state.is_terminal() {
                return false;
            }
            negotiation.state = SessionState::Disconnected;
            negotiation.pending_candidates.clear();
        }
        info!("Session {} disconnected", self.id);
        self.disconnected.emit(&());
        true
    }

    fn begin_negotiation(&self) -> Result<(), RtcError> {
        let mut negotiation = self.negotiation.lock();
        match negotiation.state {
            SessionState::Disconnected => Err(RtcError::SessionClosed(self.id.clone())),
            SessionState::New => {
                negotiation.state = SessionState::Negotiating;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Record that the remote description is in place, emit `lead` (if any)
    /// and then every held-back local candidate in gathering order.
    fn mark_remote_applied(&self, lead: Option<&Signal>) -> usize {
        let mut negotiation = self.negotiation.lock();
        negotiation.remote_applied = true;
        let pending = std::mem::take(&mut negotiation.pending_candidates);
        if let Some(signal) = lead {
            self.signals.emit(signal);
        }
        let flushed = pending.len();
        for candidate in pending {
            self.signals.emit(&Signal::candidate(self.id.clone(), candidate));
        }
        flushed
    }

    fn handle_remote_track(self: &Arc<Self>, track: Arc<TrackRemote>) {
        info!(
            "Session {} received {} track {} ({})",
            self.id,
            track.kind(),
            track.id(),
            track.codec().capability.mime_type
        );
        let relay = RelayTrack::spawn(track, Arc::downgrade(self), self.keyframe_interval);
        self.local_tracks.write().push(relay.clone());
        self.tracks.emit(&relay);
    }

    fn attach_data_channel(self: &Arc<Self>, channel: Arc<RTCDataChannel>) {
        let weak: Weak<Session> = Arc::downgrade(self);
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(session) = weak.upgrade() {
                    session.data.emit(&msg.data);
                }
            })
        }));
        *self.data_channel.write() = Some(channel);
    }
}
