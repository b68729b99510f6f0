//! Broadcast streams
//!
//! A stream ties one capture endpoint to its viewers:
//! - long-poll mailboxes in both directions (`SignalBuffer`)
//! - availability from capture activity (`Keepalive`)
//! - direct-connect mailbox routing or relayed SFU sessions (`Stream`)
//! - the per-process stream table (`BroadcastRegistry`)

pub mod broadcast;
pub mod keepalive;
pub mod manager;
pub mod signal_buffer;

pub use broadcast::Stream;
pub use keepalive::Keepalive;
pub use manager::BroadcastRegistry;
pub use signal_buffer::{DrainOrder, SignalBuffer};

use crate::config::SignalingConfig;
use crate::rtc::RtcError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream not found")]
    StreamNotFound(String),

    #[error(transparent)]
    Rtc(#[from] RtcError),
}

/// Timing and relay parameters shared by every stream
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub viewer_poll_timeout: Duration,
    pub capture_poll_timeout: Duration,
    pub keepalive: Duration,
    pub sweep_interval: Duration,
    pub keyframe_interval: Duration,
    pub expected_tracks: usize,
}

impl StreamSettings {
    pub fn from_config(config: &SignalingConfig) -> Self {
        Self {
            viewer_poll_timeout: Duration::from_secs(config.viewer_poll_timeout_secs),
            capture_poll_timeout: Duration::from_secs(config.capture_poll_timeout_secs),
            keepalive: Duration::from_secs(config.keepalive_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            keyframe_interval: Duration::from_millis(config.keyframe_interval_ms),
            expected_tracks: config.expected_tracks,
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from_config(&SignalingConfig::default())
    }
}

/// Body of a capture endpoint registration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStreamBody {
    #[serde(default)]
    pub is_direct_connect: bool,
    #[serde(default)]
    pub is_private: bool,
}

/// One row of the public stream listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamListing {
    pub stream_id: String,
    pub viewers: usize,
    /// Seconds
    pub uptime: u64,
    pub direct_connect: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEventKind {
    ViewerConnected,
    ViewerDisconnected,
}

/// Viewer connect/disconnect report from a direct-connect capture endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    #[serde(rename = "type")]
    pub kind: ConnectionEventKind,
    pub viewer_id: String,
    pub viewer_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_event_wire_format() {
        let event: ConnectionEvent =
            serde_json::from_str(r#"{"type":"viewer_connected","viewerId":"ABC","viewerCount":3}"#).unwrap();
        assert_eq!(event.kind, ConnectionEventKind::ViewerConnected);
        assert_eq!(event.viewer_count, 3);
    }

    #[test]
    fn test_new_stream_body_defaults() {
        let body: NewStreamBody = serde_json::from_str("{}").unwrap();
        assert_eq!(body, NewStreamBody::default());
        let body: NewStreamBody = serde_json::from_str(r#"{"isDirectConnect":true,"isPrivate":true}"#).unwrap();
        assert!(body.is_direct_connect && body.is_private);
    }

    #[test]
    fn test_listing_field_names() {
        let listing = StreamListing {
            stream_id: "desk".to_string(),
            viewers: 2,
            uptime: 30,
            direct_connect: false,
        };
        let value = serde_json::to_value(&listing).unwrap();
        assert_eq!(value["streamId"], "desk");
        assert_eq!(value["directConnect"], false);
    }
}
