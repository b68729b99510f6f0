//! WebRTC session layer
//!
//! This module wraps `webrtc-rs` peer connections with:
//! - Offer/answer negotiation and candidate sequencing (`Session`)
//! - Keyed session bookkeeping with lifecycle events (`SessionRegistry`)
//! - RTP and data channel forwarding between sessions (`relay`)

pub mod events;
pub mod peer_connection;
pub mod registry;
pub mod relay;
pub mod session;
pub mod signal;

#[cfg(test)]
pub(crate) mod test_support;

pub use events::Listeners;
pub use peer_connection::PeerConnectionFactory;
pub use registry::SessionRegistry;
pub use relay::{connect_to, RelayTrack};
pub use session::{Session, SessionState};
pub use signal::{Signal, SignalKind};

use thiserror::Error;

/// WebRTC-related errors
#[derive(Debug, Error)]
pub enum RtcError {
    /// Peer connection creation or teardown failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// SDP processing failed
    #[error("SDP error: {0}")]
    Sdp(String),

    /// ICE candidate processing failed
    #[error("ICE error: {0}")]
    Ice(String),

    /// Data channel error
    #[error("DataChannel error: {0}")]
    DataChannel(String),

    /// Media track error
    #[error("Media error: {0}")]
    Media(String),

    /// A remote candidate arrived before any remote description was applied
    #[error("Session {0} received a candidate before an offer")]
    CandidateBeforeOffer(String),

    /// The session already reached its terminal state
    #[error("Session {0} is closed")]
    SessionClosed(String),
}
