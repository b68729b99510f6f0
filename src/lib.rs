//! streamrelay-core - broadcast relay for WebRTC streams
//!
//! Capture endpoints register streams over HTTP; viewers negotiate either
//! straight with the capture endpoint (direct-connect) or with the relay,
//! which forwards media from one upstream peer connection to every viewer.

pub mod args;
pub mod config;
pub mod rtc;
pub mod stream;
pub mod transport;
pub mod web;

// Re-exports
pub use config::{Config, IceServerConfig, WebRTCConfig};
pub use rtc::{PeerConnectionFactory, RtcError, Session, SessionRegistry, Signal, SignalKind};
pub use stream::{BroadcastRegistry, Stream, StreamError, StreamSettings};
pub use transport::{ClientError, SignalingClient};
